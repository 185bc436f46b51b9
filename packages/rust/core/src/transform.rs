//! Transform stage: turns raw records into entries packed into batches.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info};

use treedump_shared::{RawRecord, RecordPath, Result, TreeDumpError, is_hidden_path};
use treedump_source::PathPredicate;

use crate::batch::NodeEntryBatch;
use crate::cancel::{CancelToken, recv_or_cancel, send_or_cancel};
use crate::download::RawQueueItem;
use crate::entry::EntryWriter;
use crate::pool::BufferPool;
use crate::stats::{LiveCounters, TransformStatistics};

#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub worker_id: usize,
    pub entries_extracted: u64,
    pub statistics: TransformStatistics,
}

pub struct TransformStage {
    worker_id: usize,
    raw_rx: Receiver<RawQueueItem>,
    /// Used to pass the end-of-stream marker on to the other workers.
    raw_tx: Sender<RawQueueItem>,
    pool: Arc<BufferPool>,
    predicate: Arc<dyn PathPredicate>,
    writer: EntryWriter,
    live: Arc<LiveCounters>,
    cancel: CancelToken,
    current: Option<NodeEntryBatch>,
    statistics: TransformStatistics,
}

impl TransformStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        raw_rx: Receiver<RawQueueItem>,
        raw_tx: Sender<RawQueueItem>,
        pool: Arc<BufferPool>,
        predicate: Arc<dyn PathPredicate>,
        writer: EntryWriter,
        live: Arc<LiveCounters>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            worker_id,
            raw_rx,
            raw_tx,
            pool,
            predicate,
            writer,
            live,
            cancel,
            current: None,
            statistics: TransformStatistics::default(),
        }
    }

    /// Runs until the end-of-stream marker, then flushes the partial batch.
    pub fn run(mut self) -> Result<TransformOutcome> {
        debug!(worker = self.worker_id, "transform started");
        loop {
            match recv_or_cancel(&self.raw_rx, &self.cancel)? {
                Some(RawQueueItem::Batch(batch)) => {
                    for record in batch.records {
                        self.process(record)?;
                    }
                }
                Some(RawQueueItem::EndOfStream) => {
                    send_or_cancel(&self.raw_tx, RawQueueItem::EndOfStream, &self.cancel)?;
                    break;
                }
                None => {
                    return Err(TreeDumpError::validation(
                        "raw record queue closed before end of stream",
                    ));
                }
            }
        }

        if let Some(batch) = self.current.take() {
            if batch.is_empty() {
                self.pool.return_empty(batch, &self.cancel)?;
            } else {
                self.pool.submit_full(batch, &self.cancel)?;
            }
        }

        info!(
            worker = self.worker_id,
            stats = %self.statistics.format_stats(),
            "transform finished"
        );
        Ok(TransformOutcome {
            worker_id: self.worker_id,
            entries_extracted: self.statistics.entries_accepted,
            statistics: self.statistics,
        })
    }

    fn process(&mut self, record: RawRecord) -> Result<()> {
        self.statistics.documents_processed += 1;
        self.live.document_processed();

        let path = match record.resolve_path()? {
            RecordPath::Node(path) => path,
            RecordPath::Split => {
                self.statistics.split_documents_rejected += 1;
                return Ok(());
            }
        };
        if record.deleted {
            self.statistics.record_empty_node_state(&path);
            self.live.entry_rejected();
            return Ok(());
        }
        if is_hidden_path(&path) {
            self.statistics.record_hidden(&path);
            self.live.entry_rejected();
            return Ok(());
        }
        if !self.predicate.test(&path) {
            self.statistics.record_filtered(&path);
            self.live.entry_rejected();
            return Ok(());
        }

        let payload = self.writer.serialize(&path, &record.fields)?;
        self.append(&path, &payload)?;
        self.statistics.record_accepted(payload.len());
        self.live.entry_accepted();
        Ok(())
    }

    /// Append to the current batch, swapping it for an empty one when full.
    fn append(&mut self, path: &str, payload: &[u8]) -> Result<()> {
        loop {
            let mut batch = match self.current.take() {
                Some(batch) => batch,
                None => self.pool.acquire_empty(&self.cancel)?,
            };
            if batch.has_space_for(payload.len()) {
                batch.add_entry(path, payload)?;
                self.current = Some(batch);
                return Ok(());
            }
            if batch.is_empty() {
                return Err(TreeDumpError::validation(format!(
                    "entry for '{path}' ({} bytes) is larger than an empty batch ({} bytes, {} entries)",
                    payload.len(),
                    batch.capacity_bytes(),
                    batch.max_entries()
                )));
            }
            debug!(worker = self.worker_id, entries = batch.len(), bytes = batch.size_bytes(), "batch full");
            self.pool.submit_full(batch, &self.cancel)?;
        }
    }
}
