//! Cooperative cancellation for blocking stage workers.
//!
//! Every blocking queue operation in a stage waits on the queue and on the
//! stage's [`CancelToken`] at the same time, so a cancelled stage stops at its
//! next blocking point.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};

use treedump_shared::{Result, TreeDumpError};

/// Cancellation handle shared by the coordinator and one stage.
///
/// Cancelling drops the only sender of a zero-capacity channel; every blocked
/// receiver wakes up with a disconnect.
#[derive(Debug, Clone)]
pub struct CancelToken {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let mut trigger = self.trigger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take();
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TreeDumpError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive from `rx` unless cancelled first. `None` if every sender is gone.
pub fn recv_or_cancel<T>(rx: &Receiver<T>, cancel: &CancelToken) -> Result<Option<T>> {
    cancel.check()?;
    select! {
        recv(rx) -> msg => Ok(msg.ok()),
        recv(cancel.signal) -> _ => Err(TreeDumpError::Cancelled),
    }
}

/// Send `item` on `tx` unless cancelled first. The item is dropped on cancel.
pub fn send_or_cancel<T>(tx: &Sender<T>, item: T, cancel: &CancelToken) -> Result<()> {
    cancel.check()?;
    select! {
        send(tx, item) -> res => res.map_err(|_| TreeDumpError::validation("queue receiver disconnected")),
        recv(cancel.signal) -> _ => Err(TreeDumpError::Cancelled),
    }
}
