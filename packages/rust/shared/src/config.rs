//! Application configuration for treedump.
//!
//! User config lives at `~/.treedump/treedump.toml`.
//! CLI flags (and their `TREEDUMP_*` environment variables) override config
//! file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeDumpError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "treedump.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".treedump";

/// A single document is at most 16 MB, so the raw queue must be able to hold one.
pub const MIN_DOC_QUEUE_RESERVED_MEMORY_MB: u32 = 16;

/// The raw queue must hold at least this many batches of maximum size.
pub const MIN_DOC_QUEUE_BATCHES: u32 = 8;

// ---------------------------------------------------------------------------
// Config structs (matching treedump.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Output store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Path filters applied by the download and transform stages.
    #[serde(default)]
    pub filters: FiltersConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum size of one batch of raw records, in MB.
    #[serde(default = "default_doc_batch_max_size_mb")]
    pub doc_batch_max_size_mb: u32,

    /// Maximum number of raw records in one batch.
    #[serde(default = "default_doc_batch_max_documents")]
    pub doc_batch_max_documents: u32,

    /// Memory reserved for the download -> transform queue, in MB.
    #[serde(default = "default_doc_queue_reserved_memory_mb")]
    pub doc_queue_reserved_memory_mb: u32,

    /// Number of transform workers.
    #[serde(default = "default_transform_threads")]
    pub transform_threads: u32,

    /// Working memory for the entry batches, in MB. 0 means auto-detect.
    #[serde(default)]
    pub working_memory_mb: u32,

    /// Share of each buffer reserved for the sort keys array, between 1 and 100.
    #[serde(default = "default_sort_buffer_memory_percentage")]
    pub sort_buffer_memory_percentage: u32,

    /// Seconds between progress/statistics log lines while waiting on stages.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    /// Seconds to wait for cancelled stages to stop before detaching them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            doc_batch_max_size_mb: default_doc_batch_max_size_mb(),
            doc_batch_max_documents: default_doc_batch_max_documents(),
            doc_queue_reserved_memory_mb: default_doc_queue_reserved_memory_mb(),
            transform_threads: default_transform_threads(),
            working_memory_mb: 0,
            sort_buffer_memory_percentage: default_sort_buffer_memory_percentage(),
            stats_interval_secs: default_stats_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_doc_batch_max_size_mb() -> u32 {
    4
}
fn default_doc_batch_max_documents() -> u32 {
    10_000
}
fn default_doc_queue_reserved_memory_mb() -> u32 {
    128
}
fn default_transform_threads() -> u32 {
    2
}
fn default_sort_buffer_memory_percentage() -> u32 {
    25
}
fn default_stats_interval_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

impl PipelineConfig {
    /// Check every tunable, individually and against each other.
    pub fn validate(&self) -> Result<()> {
        if self.doc_queue_reserved_memory_mb < MIN_DOC_QUEUE_RESERVED_MEMORY_MB {
            return Err(TreeDumpError::config(format!(
                "invalid value for doc_queue_reserved_memory_mb: {}. Must be >= {MIN_DOC_QUEUE_RESERVED_MEMORY_MB}",
                self.doc_queue_reserved_memory_mb
            )));
        }
        if self.doc_batch_max_size_mb == 0 {
            return Err(TreeDumpError::config(
                "invalid value for doc_batch_max_size_mb: 0. Must be > 0",
            ));
        }
        if self.doc_batch_max_documents == 0 {
            return Err(TreeDumpError::config(
                "invalid value for doc_batch_max_documents: 0. Must be > 0",
            ));
        }
        if self.transform_threads == 0 {
            return Err(TreeDumpError::config(
                "invalid value for transform_threads: 0. Must be > 0",
            ));
        }
        if self.sort_buffer_memory_percentage == 0 || self.sort_buffer_memory_percentage > 100 {
            return Err(TreeDumpError::config(format!(
                "invalid value for sort_buffer_memory_percentage: {}. Must be between 1 and 100",
                self.sort_buffer_memory_percentage
            )));
        }
        if u64::from(self.doc_queue_reserved_memory_mb)
            < u64::from(MIN_DOC_QUEUE_BATCHES) * u64::from(self.doc_batch_max_size_mb)
        {
            return Err(TreeDumpError::config(format!(
                "doc_queue_reserved_memory_mb must be at least {MIN_DOC_QUEUE_BATCHES}x doc_batch_max_size_mb, \
                 but are {} and {}, respectively",
                self.doc_queue_reserved_memory_mb, self.doc_batch_max_size_mb
            )));
        }
        if self.stats_interval_secs == 0 {
            return Err(TreeDumpError::config(
                "invalid value for stats_interval_secs: 0. Must be > 0",
            ));
        }
        Ok(())
    }

    /// Capacity of the raw record queue, in batches.
    pub fn doc_queue_capacity(&self) -> usize {
        (self.doc_queue_reserved_memory_mb / self.doc_batch_max_size_mb.max(1)) as usize
    }

    /// `(key, value)` pairs of every tunable, for the indexing report.
    pub fn as_report_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("pipeline.doc_batch_max_size_mb", self.doc_batch_max_size_mb.to_string()),
            ("pipeline.doc_batch_max_documents", self.doc_batch_max_documents.to_string()),
            (
                "pipeline.doc_queue_reserved_memory_mb",
                self.doc_queue_reserved_memory_mb.to_string(),
            ),
            ("pipeline.transform_threads", self.transform_threads.to_string()),
            ("pipeline.working_memory_mb", self.working_memory_mb.to_string()),
            (
                "pipeline.sort_buffer_memory_percentage",
                self.sort_buffer_memory_percentage.to_string(),
            ),
        ]
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Default output directory for sorted stores.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "var/treedump".into()
}

/// `[filters]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Only subtrees under these paths are downloaded. Empty means everything.
    #[serde(default)]
    pub included_paths: Vec<String>,

    /// Subtrees under these paths are never downloaded.
    #[serde(default)]
    pub excluded_paths: Vec<String>,

    /// Glob patterns of paths dropped by the transform stage.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.treedump/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TreeDumpError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.treedump/treedump.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TreeDumpError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TreeDumpError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TreeDumpError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TreeDumpError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TreeDumpError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
