//! Sort-and-store stage: sorts each full batch and appends it to the output store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use treedump_shared::Result;
use treedump_storage::SortedStoreWriter;

use crate::batch::NodeEntryBatch;
use crate::cancel::CancelToken;
use crate::entry::decode_entry;
use crate::pool::{BufferPool, FullBatch};

pub struct SortStoreOutcome {
    pub entries_stored: u64,
    pub batches_stored: u64,
    pub sort_time: Duration,
    pub write_time: Duration,
    /// The store, still open. Only a successful run closes it.
    pub store: SortedStoreWriter,
}

pub struct SortStoreStage {
    pool: Arc<BufferPool>,
    store: SortedStoreWriter,
    cancel: CancelToken,
}

impl SortStoreStage {
    pub fn new(pool: Arc<BufferPool>, store: SortedStoreWriter, cancel: CancelToken) -> Self {
        Self { pool, store, cancel }
    }

    /// Runs until the end-of-input marker.
    pub fn run(mut self) -> Result<SortStoreOutcome> {
        let mut entries_stored = 0u64;
        let mut batches_stored = 0u64;
        let mut sort_time = Duration::ZERO;
        let mut write_time = Duration::ZERO;

        loop {
            let mut batch = match self.pool.acquire_full(&self.cancel)? {
                FullBatch::Batch(batch) => batch,
                FullBatch::EndOfInput => break,
            };

            let started = Instant::now();
            batch.sort();
            let sorted = started.elapsed();
            let stored = self.store_batch(&batch)?;
            let written = started.elapsed() - sorted;

            entries_stored += stored;
            batches_stored += 1;
            sort_time += sorted;
            write_time += written;
            debug!(
                batch = batches_stored,
                entries = stored,
                sort_ms = sorted.as_millis() as u64,
                write_ms = written.as_millis() as u64,
                "batch sorted and stored"
            );
            self.pool.return_empty(batch, &self.cancel)?;
        }

        info!(
            entries = entries_stored,
            batches = batches_stored,
            sort_ms = sort_time.as_millis() as u64,
            write_ms = write_time.as_millis() as u64,
            "sort-and-store finished"
        );
        Ok(SortStoreOutcome {
            entries_stored,
            batches_stored,
            sort_time,
            write_time,
            store: self.store,
        })
    }

    fn store_batch(&mut self, batch: &NodeEntryBatch) -> Result<u64> {
        let entries = batch
            .sort_keys()
            .iter()
            .map(|key| {
                let (_, json) = decode_entry(batch.payload_at(key.offset)?)?;
                Ok((key.path.as_str(), json))
            })
            .collect::<Result<Vec<_>>>()?;
        let count = entries.len() as u64;
        self.store.append(entries)?;
        Ok(count)
    }
}
