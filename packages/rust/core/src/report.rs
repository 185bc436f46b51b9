//! Reporter sink for configuration, timings and metrics of a run.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use serde::Serialize;

/// Receives named configuration values, timings and counters for the run report.
pub trait IndexingReporter: Send + Sync {
    fn add_config(&self, key: &str, value: &str);
    fn add_timing(&self, stage: &str, value: &str);
    fn add_metric(&self, name: &str, value: u64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl IndexingReporter for NoopReporter {
    fn add_config(&self, _key: &str, _value: &str) {}
    fn add_timing(&self, _stage: &str, _value: &str) {}
    fn add_metric(&self, _name: &str, _value: u64) {}
}

/// Everything recorded during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub config: BTreeMap<String, String>,
    pub timings: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, u64>,
}

/// Keeps the report in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    report: Mutex<Report>,
}

impl MemoryReporter {
    pub fn report(&self) -> Report {
        self.lock().clone()
    }

    /// Plain-text report, one `key: value` per line, grouped by section.
    pub fn generate_report(&self) -> String {
        let report = self.lock();
        let mut out = String::new();
        for (title, entries) in [("Configuration", &report.config), ("Timings", &report.timings)] {
            let _ = writeln!(out, "{title}:");
            for (key, value) in entries {
                let _ = writeln!(out, "  {key}: {value}");
            }
        }
        let _ = writeln!(out, "Metrics:");
        for (key, value) in &report.metrics {
            let _ = writeln!(out, "  {key}: {value}");
        }
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Report> {
        self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl IndexingReporter for MemoryReporter {
    fn add_config(&self, key: &str, value: &str) {
        self.lock().config.insert(key.to_string(), value.to_string());
    }

    fn add_timing(&self, stage: &str, value: &str) {
        self.lock().timings.insert(stage.to_string(), value.to_string());
    }

    fn add_metric(&self, name: &str, value: u64) {
        self.lock().metrics.insert(name.to_string(), value);
    }
}
