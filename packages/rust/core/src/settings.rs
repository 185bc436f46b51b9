//! Resolved pipeline settings: validated configuration plus the memory budget.

use std::time::Duration;

use tracing::info;

use treedump_shared::{PipelineConfig, Result};

use crate::memory::{MemoryBudget, format_bytes, resolve_working_memory_bytes};
use crate::report::IndexingReporter;

const ONE_MB: usize = 1024 * 1024;

/// Everything the coordinator needs to size queues and buffers.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub doc_batch_max_bytes: usize,
    pub doc_batch_max_documents: usize,
    /// Raw-record queue capacity, in batches.
    pub doc_queue_capacity: usize,
    pub transform_threads: usize,
    pub budget: MemoryBudget,
    pub stats_interval: Duration,
    pub shutdown_grace: Duration,
}

impl PipelineSettings {
    /// Validate `config`, plan memory and record every resolved value in `reporter`.
    pub fn resolve(config: &PipelineConfig, reporter: &dyn IndexingReporter) -> Result<Self> {
        config.validate()?;

        let working_memory = resolve_working_memory_bytes(config.working_memory_mb);
        let transform_threads = config.transform_threads as usize;
        let budget = MemoryBudget::plan(
            working_memory,
            transform_threads,
            config.sort_buffer_memory_percentage,
        )?;

        let settings = Self {
            doc_batch_max_bytes: config.doc_batch_max_size_mb as usize * ONE_MB,
            doc_batch_max_documents: config.doc_batch_max_documents as usize,
            doc_queue_capacity: config.doc_queue_capacity(),
            transform_threads,
            budget,
            stats_interval: Duration::from_secs(config.stats_interval_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        };

        info!(
            doc_queue_capacity = settings.doc_queue_capacity,
            doc_batch_max = %format_bytes(settings.doc_batch_max_bytes as u64),
            doc_batch_max_documents = settings.doc_batch_max_documents,
            transform_threads,
            working_memory = %format_bytes(working_memory),
            buffers = budget.buffer_count,
            buffer_size = %format_bytes(budget.per_buffer_bytes as u64),
            max_entries_per_buffer = budget.max_entries_per_buffer,
            "pipeline settings resolved"
        );

        for (key, value) in config.as_report_entries() {
            reporter.add_config(key, &value);
        }
        reporter.add_config("pipeline.resolved_working_memory_bytes", &working_memory.to_string());
        reporter.add_config("pipeline.buffer_count", &budget.buffer_count.to_string());
        reporter.add_config("pipeline.buffer_size_bytes", &budget.per_buffer_bytes.to_string());
        reporter.add_config(
            "pipeline.max_entries_per_buffer",
            &budget.max_entries_per_buffer.to_string(),
        );

        Ok(settings)
    }
}
