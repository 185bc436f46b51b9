//! Core pipeline for treedump.
//!
//! Dumps a document store into a path-sorted output store through three
//! stages connected by bounded queues:
//! download → transform (×N) → sort-and-store.
//! Entry batches are allocated once and cycle through a [`BufferPool`].

pub mod batch;
pub mod cancel;
pub mod download;
pub mod entry;
pub mod memory;
pub mod pipeline;
pub mod pool;
pub mod report;
pub mod settings;
pub mod sort_store;
pub mod stats;
pub mod transform;

pub use batch::{NodeEntryBatch, SortKey};
pub use cancel::CancelToken;
pub use entry::{BlobResolver, EntryWriter, PassthroughBlobResolver};
pub use memory::MemoryBudget;
pub use pipeline::{
    DumpResult, PHASE_TARGET, PipelineState, ProgressReporter, QueueSnapshot, SilentProgress,
    SortedDump, Termination,
};
pub use pool::{BufferPool, FullBatch, PoolSnapshot};
pub use report::{IndexingReporter, MemoryReporter, NoopReporter, Report};
pub use settings::PipelineSettings;
pub use stats::{BoundedHistogram, TransformStatistics};
