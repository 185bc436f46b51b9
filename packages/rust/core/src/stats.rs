//! Transform statistics.
//!
//! Each transform worker keeps its own [`TransformStatistics`] and returns it
//! when done; the coordinator folds them together. [`LiveCounters`] are the
//! only shared counters and exist for the periodic progress log.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use treedump_shared::{path_depth, path_prefix};

use crate::report::IndexingReporter;

/// Keys kept per histogram before new prefixes are dropped.
pub const MAX_HISTOGRAM_KEYS: usize = 1000;
/// Histogram keys are parent paths truncated to this many elements.
pub const HISTOGRAM_PREFIX_DEPTH: usize = 3;

/// Counts per path prefix, with a bounded number of keys.
#[derive(Debug, Clone)]
pub struct BoundedHistogram {
    name: &'static str,
    counts: HashMap<String, u64>,
    max_keys: usize,
    overflowed: bool,
}

impl BoundedHistogram {
    pub fn new(name: &'static str) -> Self {
        Self::with_max_keys(name, MAX_HISTOGRAM_KEYS)
    }

    pub fn with_max_keys(name: &'static str, max_keys: usize) -> Self {
        Self {
            name,
            counts: HashMap::new(),
            max_keys,
            overflowed: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&mut self, key: &str) {
        self.add_count(key, 1);
    }

    fn add_count(&mut self, key: &str, count: u64) {
        if let Some(existing) = self.counts.get_mut(key) {
            *existing += count;
        } else if self.counts.len() < self.max_keys {
            self.counts.insert(key.to_string(), count);
        } else {
            self.overflowed = true;
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// True once a new key was dropped for lack of room.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn merge(&mut self, other: &BoundedHistogram) {
        for (key, count) in &other.counts {
            self.add_count(key, *count);
        }
        self.overflowed |= other.overflowed;
    }

    /// The `n` largest buckets, by count and then key.
    pub fn top(&self, n: usize) -> Vec<(&str, u64)> {
        let mut buckets: Vec<(&str, u64)> = self.counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        buckets.truncate(n);
        buckets
    }

    pub fn pretty_print(&self) -> String {
        let mut out = format!("{}: [", self.name);
        for (i, (key, count)) in self.top(self.counts.len()).into_iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{key}: {count}");
        }
        out.push(']');
        if self.overflowed {
            out.push_str(" (truncated)");
        }
        out
    }
}

/// Histogram key for a rejected path: its parent, at most three elements deep.
pub fn histogram_key(path: &str) -> String {
    let parent_depth = path_depth(path).saturating_sub(1);
    path_prefix(path, parent_depth.min(HISTOGRAM_PREFIX_DEPTH))
}

/// Counters and rejection histograms of one or more transform workers.
#[derive(Debug, Clone)]
pub struct TransformStatistics {
    pub documents_processed: u64,
    pub split_documents_rejected: u64,
    pub empty_node_states_rejected: u64,
    pub entries_accepted: u64,
    pub hidden_entries_rejected: u64,
    pub filtered_entries_rejected: u64,
    pub extracted_bytes: u64,
    pub hidden_paths: BoundedHistogram,
    pub filtered_paths: BoundedHistogram,
    pub empty_node_states: BoundedHistogram,
}

impl Default for TransformStatistics {
    fn default() -> Self {
        Self {
            documents_processed: 0,
            split_documents_rejected: 0,
            empty_node_states_rejected: 0,
            entries_accepted: 0,
            hidden_entries_rejected: 0,
            filtered_entries_rejected: 0,
            extracted_bytes: 0,
            hidden_paths: BoundedHistogram::new("hiddenPathsRejected"),
            filtered_paths: BoundedHistogram::new("filteredPathsRejected"),
            empty_node_states: BoundedHistogram::new("emptyNodeStateHistogram"),
        }
    }
}

impl TransformStatistics {
    pub fn record_hidden(&mut self, path: &str) {
        self.hidden_entries_rejected += 1;
        self.hidden_paths.add(&histogram_key(path));
    }

    pub fn record_filtered(&mut self, path: &str) {
        self.filtered_entries_rejected += 1;
        self.filtered_paths.add(&histogram_key(path));
    }

    pub fn record_empty_node_state(&mut self, path: &str) {
        self.empty_node_states_rejected += 1;
        self.empty_node_states.add(&histogram_key(path));
    }

    pub fn record_accepted(&mut self, payload_bytes: usize) {
        self.entries_accepted += 1;
        self.extracted_bytes += payload_bytes as u64;
    }

    /// Node entries dropped before serialization. Split documents are not entries.
    pub fn entries_rejected(&self) -> u64 {
        self.empty_node_states_rejected + self.hidden_entries_rejected + self.filtered_entries_rejected
    }

    pub fn merge(&mut self, other: &TransformStatistics) {
        self.documents_processed += other.documents_processed;
        self.split_documents_rejected += other.split_documents_rejected;
        self.empty_node_states_rejected += other.empty_node_states_rejected;
        self.entries_accepted += other.entries_accepted;
        self.hidden_entries_rejected += other.hidden_entries_rejected;
        self.filtered_entries_rejected += other.filtered_entries_rejected;
        self.extracted_bytes += other.extracted_bytes;
        self.hidden_paths.merge(&other.hidden_paths);
        self.filtered_paths.merge(&other.filtered_paths);
        self.empty_node_states.merge(&other.empty_node_states);
    }

    /// Counters as `(name, value)` pairs.
    pub fn metrics(&self) -> [(&'static str, u64); 8] {
        [
            ("documents_processed", self.documents_processed),
            ("split_documents_rejected", self.split_documents_rejected),
            ("empty_node_states_rejected", self.empty_node_states_rejected),
            ("entries_accepted", self.entries_accepted),
            ("entries_rejected", self.entries_rejected()),
            ("hidden_entries_rejected", self.hidden_entries_rejected),
            ("filtered_entries_rejected", self.filtered_entries_rejected),
            ("extracted_bytes", self.extracted_bytes),
        ]
    }

    pub fn format_stats(&self) -> String {
        self.metrics()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn histograms(&self) -> [&BoundedHistogram; 3] {
        [&self.hidden_paths, &self.filtered_paths, &self.empty_node_states]
    }

    /// Record every counter as a `transform.*` metric.
    pub fn publish(&self, reporter: &dyn IndexingReporter) {
        for (name, value) in self.metrics() {
            reporter.add_metric(&format!("transform.{name}"), value);
        }
    }
}

/// Shared counters updated as records flow, read by the progress log.
#[derive(Debug, Default)]
pub struct LiveCounters {
    documents_processed: AtomicU64,
    entries_accepted: AtomicU64,
    entries_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveSnapshot {
    pub documents_processed: u64,
    pub entries_accepted: u64,
    pub entries_rejected: u64,
}

impl LiveCounters {
    pub fn document_processed(&self) {
        self.documents_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_accepted(&self) {
        self.entries_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_rejected(&self) {
        self.entries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        LiveSnapshot {
            documents_processed: self.documents_processed.load(Ordering::Relaxed),
            entries_accepted: self.entries_accepted.load(Ordering::Relaxed),
            entries_rejected: self.entries_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MemoryReporter;

    #[test]
    fn histogram_keys_are_truncated_parents() {
        assert_eq!(histogram_key("/hidden/x"), "/hidden");
        assert_eq!(histogram_key("/:hidden"), "/");
        assert_eq!(histogram_key("/a/b/c/d/e"), "/a/b/c");
        assert_eq!(histogram_key("/a/b/c/d"), "/a/b/c");
        assert_eq!(histogram_key("/"), "/");
    }

    #[test]
    fn histogram_is_bounded() {
        let mut histogram = BoundedHistogram::with_max_keys("test", 2);
        histogram.add("/a");
        histogram.add("/b");
        histogram.add("/a");
        histogram.add("/c");
        assert_eq!(histogram.get("/a"), 2);
        assert_eq!(histogram.get("/c"), 0);
        assert!(histogram.overflowed());
        assert_eq!(histogram.pretty_print(), "test: [/a: 2, /b: 1] (truncated)");
    }

    #[test]
    fn merging_adds_counters_and_buckets() {
        let mut left = TransformStatistics::default();
        left.documents_processed = 3;
        left.record_hidden("/hidden/x");
        left.record_accepted(10);

        let mut right = TransformStatistics::default();
        right.documents_processed = 2;
        right.record_hidden("/hidden/y");
        right.record_filtered("/tmp/a");
        right.record_empty_node_state("/gone/n");
        right.record_accepted(5);

        left.merge(&right);
        assert_eq!(left.documents_processed, 5);
        assert_eq!(left.entries_accepted, 2);
        assert_eq!(left.extracted_bytes, 15);
        assert_eq!(left.entries_rejected(), 4);
        assert_eq!(left.hidden_paths.get("/hidden"), 2);
        assert_eq!(left.filtered_paths.get("/tmp"), 1);
        assert_eq!(left.empty_node_states.get("/gone"), 1);
        assert!(left.format_stats().contains("entries_rejected=4"));
    }

    #[test]
    fn publishes_metrics() {
        let reporter = MemoryReporter::default();
        let mut stats = TransformStatistics::default();
        stats.record_accepted(7);
        stats.publish(&reporter);
        let report = reporter.report();
        assert_eq!(report.metrics["transform.entries_accepted"], 1);
        assert_eq!(report.metrics["transform.extracted_bytes"], 7);
    }

    #[test]
    fn live_counters_snapshot() {
        let counters = LiveCounters::default();
        counters.document_processed();
        counters.document_processed();
        counters.entry_accepted();
        counters.entry_rejected();
        assert_eq!(
            counters.snapshot(),
            LiveSnapshot { documents_processed: 2, entries_accepted: 1, entries_rejected: 1 }
        );
    }
}
