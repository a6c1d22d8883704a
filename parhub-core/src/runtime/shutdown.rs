//! Cross-thread shutdown signalling
//!
//! A stop flag paired with a loopback wake channel, so a reactor blocked in
//! its readiness wait is interrupted immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};

/// Shutdown signal broadcaster
///
/// Clone it freely and hand the clones to other threads.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Sender<()>,
    receiver: Receiver<()>,
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::Release);
        let _ = self.sender.send(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Wake channel to include in a readiness wait
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }

    /// Drain pending wakes and clear the flag
    pub fn reset(&self) {
        while self.receiver.try_recv().is_ok() {}
        self.requested.store(false, Ordering::Release);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
