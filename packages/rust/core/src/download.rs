//! Download stage: streams raw record batches from the source onto the raw queue.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, info};

use treedump_shared::{RawRecordBatch, Result};
use treedump_source::{BatchRequest, DocumentSource};

use crate::cancel::{CancelToken, send_or_cancel};

/// An item of the raw record queue.
#[derive(Debug)]
pub enum RawQueueItem {
    Batch(RawRecordBatch),
    /// The source is exhausted. Each transform worker passes it on to the next.
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub documents_downloaded: u64,
    pub batches_downloaded: u64,
    pub elapsed: Duration,
}

pub struct DownloadStage {
    source: Box<dyn DocumentSource>,
    request: BatchRequest,
    raw_tx: Sender<RawQueueItem>,
    cancel: CancelToken,
}

impl DownloadStage {
    pub fn new(
        source: Box<dyn DocumentSource>,
        request: BatchRequest,
        raw_tx: Sender<RawQueueItem>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            source,
            request,
            raw_tx,
            cancel,
        }
    }

    /// Runs until the source is exhausted. Blocks while the raw queue is full.
    pub fn run(mut self) -> Result<DownloadOutcome> {
        let start = Instant::now();
        info!(source = %self.source.describe(), "download started");

        let mut documents = 0u64;
        let mut batches = 0u64;
        loop {
            self.cancel.check()?;
            let Some(batch) = self.source.next_batch(&self.request)? else {
                break;
            };
            if batch.is_empty() {
                continue;
            }
            documents += batch.len() as u64;
            batches += 1;
            debug!(batch = batches, records = batch.len(), bytes = batch.size_bytes, "raw batch downloaded");
            send_or_cancel(&self.raw_tx, RawQueueItem::Batch(batch), &self.cancel)?;
        }
        send_or_cancel(&self.raw_tx, RawQueueItem::EndOfStream, &self.cancel)?;

        let outcome = DownloadOutcome {
            documents_downloaded: documents,
            batches_downloaded: batches,
            elapsed: start.elapsed(),
        };
        info!(
            documents = outcome.documents_downloaded,
            batches = outcome.batches_downloaded,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "download finished"
        );
        Ok(outcome)
    }
}
