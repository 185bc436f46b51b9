//! The buffer pool: a fixed set of batches moving between two bounded queues.
//!
//! Transform workers take empty batches and submit full ones; the
//! sort-and-store worker takes full batches and returns them empty. A batch is
//! owned by exactly one side at a time because it is moved through the queues.
//!
//! Ownership is also tracked in [`PoolCounts`]. Every transfer moves one batch
//! between two counts under a single lock, so a [`PoolSnapshot`] always sums
//! to the pool size. A sender moves the count before the hand-off and rolls
//! back if the hand-off fails; a receiver moves it after the hand-off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::debug;

use treedump_shared::{Result, TreeDumpError};

use crate::batch::NodeEntryBatch;
use crate::cancel::{CancelToken, recv_or_cancel, send_or_cancel};

/// An item of the full-batch queue.
#[derive(Debug)]
pub enum FullBatch {
    Batch(NodeEntryBatch),
    /// No more batches will follow.
    EndOfInput,
}

/// Where every batch of the pool is at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub buffer_count: usize,
    pub empty: usize,
    /// Full batches waiting, not counting the end-of-input marker.
    pub full: usize,
    /// Batches currently held by a worker.
    pub held: usize,
    /// Batches freed by [`BufferPool::drain_empty`].
    pub released: usize,
}

impl PoolSnapshot {
    /// True if every batch is accounted for exactly once.
    pub fn is_conserved(&self) -> bool {
        self.empty + self.full + self.held + self.released == self.buffer_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Full,
    Held,
    Released,
}

#[derive(Debug, Default)]
struct PoolCounts {
    empty: usize,
    full: usize,
    held: usize,
    released: usize,
}

impl PoolCounts {
    fn slot(&mut self, slot: Slot) -> &mut usize {
        match slot {
            Slot::Empty => &mut self.empty,
            Slot::Full => &mut self.full,
            Slot::Held => &mut self.held,
            Slot::Released => &mut self.released,
        }
    }

    fn transfer(&mut self, from: Slot, to: Slot) {
        let source = self.slot(from);
        *source = source.saturating_sub(1);
        *self.slot(to) += 1;
    }
}

pub struct BufferPool {
    empty_tx: Sender<NodeEntryBatch>,
    empty_rx: Receiver<NodeEntryBatch>,
    full_tx: Sender<FullBatch>,
    full_rx: Receiver<FullBatch>,
    buffer_count: usize,
    counts: Mutex<PoolCounts>,
    end_signalled: AtomicBool,
}

impl BufferPool {
    /// Allocate `buffer_count` batches up front.
    pub fn new(buffer_count: usize, capacity_bytes: usize, max_entries: usize) -> Self {
        let (empty_tx, empty_rx) = crossbeam_channel::bounded(buffer_count);
        // One extra slot so the end-of-input marker never waits for a real batch.
        let (full_tx, full_rx) = crossbeam_channel::bounded(buffer_count + 1);
        for _ in 0..buffer_count {
            let batch = NodeEntryBatch::new(capacity_bytes, max_entries);
            // Cannot fail: the queue was created with room for every batch.
            let _ = empty_tx.try_send(batch);
        }
        debug!(buffer_count, capacity_bytes, max_entries, "buffer pool allocated");

        Self {
            empty_tx,
            empty_rx,
            full_tx,
            full_rx,
            buffer_count,
            counts: Mutex::new(PoolCounts {
                empty: buffer_count,
                ..PoolCounts::default()
            }),
            end_signalled: AtomicBool::new(false),
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn counts(&self) -> MutexGuard<'_, PoolCounts> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transfer(&self, from: Slot, to: Slot) {
        self.counts().transfer(from, to);
    }

    /// Take an empty batch, blocking until one is returned.
    pub fn acquire_empty(&self, cancel: &CancelToken) -> Result<NodeEntryBatch> {
        let batch = recv_or_cancel(&self.empty_rx, cancel)?
            .ok_or_else(|| TreeDumpError::validation("empty batch queue disconnected"))?;
        self.transfer(Slot::Empty, Slot::Held);
        Ok(batch)
    }

    /// Hand a filled batch to the sort-and-store stage.
    pub fn submit_full(&self, batch: NodeEntryBatch, cancel: &CancelToken) -> Result<()> {
        if self.end_signalled.load(Ordering::SeqCst) {
            return Err(TreeDumpError::validation("full batch submitted after end of input"));
        }
        self.transfer(Slot::Held, Slot::Full);
        send_or_cancel(&self.full_tx, FullBatch::Batch(batch), cancel).inspect_err(|_| {
            self.transfer(Slot::Full, Slot::Held);
        })
    }

    /// Take the next full batch or the end-of-input marker.
    pub fn acquire_full(&self, cancel: &CancelToken) -> Result<FullBatch> {
        let item = recv_or_cancel(&self.full_rx, cancel)?
            .ok_or_else(|| TreeDumpError::validation("full batch queue disconnected"))?;
        if let FullBatch::Batch(_) = item {
            self.transfer(Slot::Full, Slot::Held);
        }
        Ok(item)
    }

    /// Clear a batch and put it back in the empty queue.
    pub fn return_empty(&self, mut batch: NodeEntryBatch, cancel: &CancelToken) -> Result<()> {
        batch.clear();
        self.transfer(Slot::Held, Slot::Empty);
        send_or_cancel(&self.empty_tx, batch, cancel).inspect_err(|_| {
            self.transfer(Slot::Empty, Slot::Held);
        })
    }

    /// Enqueue the end-of-input marker. Only the first call succeeds.
    pub fn signal_end_of_input(&self) -> Result<()> {
        if self.end_signalled.swap(true, Ordering::SeqCst) {
            return Err(TreeDumpError::validation("end of input already signalled"));
        }
        self.full_tx.try_send(FullBatch::EndOfInput).map_err(|e| match e {
            TrySendError::Full(_) => TreeDumpError::validation("full batch queue has no room for end of input"),
            TrySendError::Disconnected(_) => TreeDumpError::validation("full batch queue disconnected"),
        })
    }

    pub fn end_signalled(&self) -> bool {
        self.end_signalled.load(Ordering::SeqCst)
    }

    /// Free the batches sitting in the empty queue. Returns how many were dropped.
    pub fn drain_empty(&self) -> usize {
        let mut drained = 0;
        while self.empty_rx.try_recv().is_ok() {
            self.transfer(Slot::Empty, Slot::Released);
            drained += 1;
        }
        debug!(drained, "empty batches released");
        drained
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let counts = self.counts();
        PoolSnapshot {
            buffer_count: self.buffer_count,
            empty: counts.empty,
            full: counts.full,
            held: counts.held,
            released: counts.released,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn batches_cycle_through_the_queues() {
        let pool = BufferPool::new(3, 64, 8);
        let cancel = CancelToken::new();
        assert_eq!(pool.snapshot(), PoolSnapshot { buffer_count: 3, empty: 3, full: 0, held: 0, released: 0 });

        let mut a = pool.acquire_empty(&cancel).unwrap();
        let b = pool.acquire_empty(&cancel).unwrap();
        assert!(pool.snapshot().is_conserved());
        assert_eq!(pool.snapshot().held, 2);

        a.add_entry("/a", b"x").unwrap();
        pool.submit_full(a, &cancel).unwrap();
        assert_eq!(pool.snapshot(), PoolSnapshot { buffer_count: 3, empty: 1, full: 1, held: 1, released: 0 });

        let FullBatch::Batch(full) = pool.acquire_full(&cancel).unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(full.len(), 1);
        pool.return_empty(full, &cancel).unwrap();
        pool.return_empty(b, &cancel).unwrap();
        assert_eq!(pool.snapshot(), PoolSnapshot { buffer_count: 3, empty: 3, full: 0, held: 0, released: 0 });

        // Returned batches come back cleared.
        for _ in 0..3 {
            assert!(pool.acquire_empty(&cancel).unwrap().is_empty());
        }
    }

    #[test]
    fn end_of_input_is_signalled_once_after_real_batches() {
        let pool = BufferPool::new(2, 64, 8);
        let cancel = CancelToken::new();
        let a = pool.acquire_empty(&cancel).unwrap();
        let b = pool.acquire_empty(&cancel).unwrap();
        pool.submit_full(a, &cancel).unwrap();
        pool.submit_full(b, &cancel).unwrap();

        // Both buffers are full and the marker still fits.
        pool.signal_end_of_input().unwrap();
        assert!(pool.signal_end_of_input().is_err());
        assert_eq!(pool.snapshot().full, 2);
        assert!(pool.snapshot().is_conserved());

        assert!(matches!(pool.acquire_full(&cancel).unwrap(), FullBatch::Batch(_)));
        assert!(matches!(pool.acquire_full(&cancel).unwrap(), FullBatch::Batch(_)));
        assert!(matches!(pool.acquire_full(&cancel).unwrap(), FullBatch::EndOfInput));
        assert_eq!(pool.snapshot().full, 0);
    }

    #[test]
    fn submissions_after_end_of_input_are_rejected() {
        let pool = BufferPool::new(1, 64, 8);
        let cancel = CancelToken::new();
        let batch = pool.acquire_empty(&cancel).unwrap();
        pool.signal_end_of_input().unwrap();
        assert!(pool.submit_full(batch, &cancel).is_err());
    }

    #[test]
    fn acquire_empty_blocks_until_a_batch_is_returned() {
        // Pool of one batch, slow consumer: the producer waits instead of allocating.
        let pool = Arc::new(BufferPool::new(1, 64, 8));
        let cancel = CancelToken::new();
        let produced = Arc::new(AtomicU32::new(0));

        let producer = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let produced = Arc::clone(&produced);
            thread::spawn(move || {
                for i in 0..3 {
                    let mut batch = pool.acquire_empty(&cancel).unwrap();
                    batch.add_entry(&format!("/{i}"), b"x").unwrap();
                    pool.submit_full(batch, &cancel).unwrap();
                    produced.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(produced.load(Ordering::SeqCst), 1);
        assert_eq!(pool.snapshot(), PoolSnapshot { buffer_count: 1, empty: 0, full: 1, held: 0, released: 0 });

        for expected in 1..=3 {
            let FullBatch::Batch(batch) = pool.acquire_full(&cancel).unwrap() else {
                panic!("expected a batch");
            };
            thread::sleep(Duration::from_millis(20));
            assert!(pool.snapshot().empty + pool.snapshot().full <= 1);
            pool.return_empty(batch, &cancel).unwrap();
            if expected < 3 {
                thread::sleep(Duration::from_millis(50));
                assert_eq!(produced.load(Ordering::SeqCst), expected + 1);
            }
        }
        producer.join().unwrap();
        assert!(pool.snapshot().is_conserved());
    }

    #[test]
    fn cancel_unblocks_acquire_empty() {
        let pool = Arc::new(BufferPool::new(1, 64, 8));
        let cancel = CancelToken::new();
        let _held = pool.acquire_empty(&cancel).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            thread::spawn(move || pool.acquire_empty(&cancel))
        };
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(TreeDumpError::Cancelled)));
    }

    #[test]
    fn drain_releases_empty_batches() {
        let pool = BufferPool::new(3, 64, 8);
        let cancel = CancelToken::new();
        let _held = pool.acquire_empty(&cancel).unwrap();
        assert_eq!(pool.drain_empty(), 2);
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.empty, 0);
        assert_eq!(snapshot.released, 2);
        assert!(snapshot.is_conserved());
    }

    #[test]
    fn snapshots_stay_conserved_while_batches_move() {
        let pool = Arc::new(BufferPool::new(2, 64, 8));
        let cancel = CancelToken::new();
        let stop = Arc::new(AtomicBool::new(false));

        let cycler = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut cycles = 0u32;
                while !stop.load(Ordering::SeqCst) {
                    let batch = pool.acquire_empty(&cancel).unwrap();
                    pool.submit_full(batch, &cancel).unwrap();
                    let FullBatch::Batch(batch) = pool.acquire_full(&cancel).unwrap() else {
                        panic!("expected a batch");
                    };
                    pool.return_empty(batch, &cancel).unwrap();
                    cycles += 1;
                }
                cycles
            })
        };

        for _ in 0..200_000 {
            let snapshot = pool.snapshot();
            assert!(snapshot.is_conserved(), "{snapshot:?}");
        }
        stop.store(true, Ordering::SeqCst);
        assert!(cycler.join().unwrap() > 0);
        assert_eq!(pool.snapshot().empty, 2);
    }

    #[test]
    fn cancelled_submit_keeps_the_batch_counted_as_held() {
        let pool = BufferPool::new(1, 64, 8);
        let cancel = CancelToken::new();
        let batch = pool.acquire_empty(&cancel).unwrap();
        cancel.cancel();

        assert!(matches!(pool.submit_full(batch, &cancel), Err(TreeDumpError::Cancelled)));
        let snapshot = pool.snapshot();
        assert_eq!((snapshot.full, snapshot.held), (0, 1));
        assert!(snapshot.is_conserved());
    }
}
