//! Single-frame replace-on-write slot

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use flume::{Receiver, RecvTimeoutError, Sender};

use crate::Frame;

/// Result of writing into a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    /// Slot was empty
    Filled,
    /// An unconsumed frame was discarded
    Overwrote,
    /// Slot was closed, write ignored
    Closed,
}

/// Capacity-1 frame cell shared by one writer and one reader.
///
/// `put` swaps the new frame in regardless of what is there, `try_take`
/// swaps `None` in and hands back whatever was pending. Neither call blocks.
/// Each put also drops a token into a capacity-1 wake channel so a reader
/// may sleep until something arrives; a full wake channel is ignored.
pub struct FrameSlot {
    cell: ArcSwapOption<Frame>,
    closed: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            cell: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    /// Replace the slot contents with `frame`
    pub fn put(&self, frame: Arc<Frame>) -> SlotWrite {
        if self.is_closed() {
            return SlotWrite::Closed;
        }

        let previous = self.cell.swap(Some(frame));

        // Lost a race with close(); don't leave a frame behind in a dead slot
        if self.is_closed() {
            self.cell.store(None);
            return SlotWrite::Closed;
        }

        let _ = self.wake_tx.try_send(());

        if previous.is_some() {
            SlotWrite::Overwrote
        } else {
            SlotWrite::Filled
        }
    }

    /// Take the pending frame, leaving the slot empty. Always `None` once
    /// the slot is closed.
    pub fn try_take(&self) -> Option<Arc<Frame>> {
        if self.is_closed() {
            return None;
        }
        let frame = self.cell.swap(None);
        if self.is_closed() {
            return None;
        }
        frame
    }

    pub fn is_pending(&self) -> bool {
        self.cell.load().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the slot dead and drop any pending frame. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cell.store(None);
            // Wake a sleeping reader so it can observe the close
            let _ = self.wake_tx.try_send(());
        }
    }

    /// Block the calling (consumer) thread until a frame arrives, the slot
    /// closes, or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_take() {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            match self.wake_rx.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => return self.try_take(),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Async variant of [`FrameSlot::wait_timeout`] without a deadline
    pub async fn wait(&self) -> Option<Arc<Frame>> {
        loop {
            if let Some(frame) = self.try_take() {
                return Some(frame);
            }
            if self.is_closed() {
                return None;
            }
            if self.wake_rx.recv_async().await.is_err() {
                return None;
            }
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
