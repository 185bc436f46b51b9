//! In-memory source, for tests and for embedding treedump behind another reader.

use std::collections::VecDeque;
use std::time::Duration;

use treedump_shared::{RawRecord, RawRecordBatch, Result, TreeDumpError};

use crate::{BatchRequest, DocumentSource};

/// Yields predefined batches, then either the end of the store or a scripted error.
#[derive(Debug, Default)]
pub struct VecSource {
    batches: VecDeque<Vec<RawRecord>>,
    failure: Option<String>,
    delay: Option<Duration>,
    batches_served: usize,
}

impl VecSource {
    /// One source batch per inner vector (after path filtering).
    pub fn from_batches(batches: Vec<Vec<RawRecord>>) -> Self {
        Self {
            batches: batches.into(),
            ..Self::default()
        }
    }

    /// A flat list of records, split into batches by the request limits.
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self::from_batches(vec![records])
    }

    /// Fail with a source error once the predefined batches are used up.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Sleep before serving each batch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of non-empty batches returned so far.
    pub fn batches_served(&self) -> usize {
        self.batches_served
    }
}

impl DocumentSource for VecSource {
    fn next_batch(&mut self, request: &BatchRequest) -> Result<Option<RawRecordBatch>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        while let Some(mut records) = self.batches.pop_front() {
            records.retain(|r| request.accepts_record(r));
            if records.is_empty() {
                continue;
            }

            // Split according to the request, keeping the remainder for later.
            let mut batch = RawRecordBatch::default();
            let mut rest = records.into_iter();
            for record in rest.by_ref() {
                let size = record.approximate_size();
                if batch.len() == request.max_documents
                    || (!batch.is_empty() && batch.size_bytes + size > request.max_bytes)
                {
                    let mut remainder = vec![record];
                    remainder.extend(rest);
                    self.batches.push_front(remainder);
                    break;
                }
                batch.push(record, size);
            }
            self.batches_served += 1;
            return Ok(Some(batch));
        }

        match self.failure.take() {
            Some(message) => Err(TreeDumpError::Source(message)),
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        format!("in-memory ({} batches pending)", self.batches.len())
    }
}
