//! Document sources: the read side of a dump.
//!
//! A [`DocumentSource`] is a read-only cursor over the backing document store
//! that hands out bounded batches of raw records. Sources also apply the
//! [`PathFilter`]s of a [`BatchRequest`] so that excluded subtrees are never
//! transferred.

pub mod filter;
pub mod jsonl;
pub mod memory;

use treedump_shared::{RawRecord, RawRecordBatch, RecordPath, Result};

pub use filter::{GlobPredicate, PathFilter, PathPredicate, accept_all};
pub use jsonl::JsonLinesSource;
pub use memory::VecSource;

/// Limits and filters for one call to [`DocumentSource::next_batch`].
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Maximum approximate size of the batch, in bytes. A single record larger
    /// than this is still returned, alone.
    pub max_bytes: usize,
    /// Maximum number of records in the batch.
    pub max_documents: usize,
    /// If non-empty, only records matching at least one filter are returned.
    pub path_filters: Vec<PathFilter>,
}

impl BatchRequest {
    /// True if a record with this path should be transferred.
    pub fn accepts(&self, path: &str) -> bool {
        self.path_filters.is_empty() || self.path_filters.iter().any(|f| f.matches(path))
    }

    /// True if a record should be transferred. Records whose path cannot be
    /// resolved here are passed through; the transform stage classifies them.
    pub fn accepts_record(&self, record: &RawRecord) -> bool {
        match record.resolve_path() {
            Ok(RecordPath::Node(path)) => self.accepts(&path),
            _ => true,
        }
    }
}

/// A read-only cursor over the backing document store.
pub trait DocumentSource: Send {
    /// Return the next batch of records, or `None` once the store is exhausted.
    ///
    /// Returned batches are never empty. Retrying failed reads is up to the
    /// implementation; an error returned here ends the dump.
    fn next_batch(&mut self, request: &BatchRequest) -> Result<Option<RawRecordBatch>>;

    /// Short description for logs.
    fn describe(&self) -> String {
        "document source".to_string()
    }
}

impl<S: DocumentSource + ?Sized> DocumentSource for Box<S> {
    fn next_batch(&mut self, request: &BatchRequest) -> Result<Option<RawRecordBatch>> {
        (**self).next_batch(request)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
