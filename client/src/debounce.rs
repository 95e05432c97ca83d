use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Trailing-edge single-shot timer with at most one outstanding timer.
///
/// Each `request` cancels the pending timer and schedules a new one; when a
/// timer expires it posts `make(generation)` to the owner's channel. The owner
/// calls [`Debouncer::accept`] with that generation so a fire that raced a
/// later request is discarded.
pub struct Debouncer<M> {
    delay: Duration,
    tx: mpsc::UnboundedSender<M>,
    make: fn(u64) -> M,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> Debouncer<M> {
    pub fn new(delay: Duration, tx: mpsc::UnboundedSender<M>, make: fn(u64) -> M) -> Self {
        Self {
            delay,
            tx,
            make,
            generation: 0,
            pending: None,
        }
    }

    /// Reset the quiet period.
    pub fn request(&mut self) {
        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let delay = self.delay;
        let tx = self.tx.clone();
        let message = (self.make)(generation);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        }));
    }

    /// Drop any pending fire without scheduling a new one.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    /// True when `generation` is the latest request; clears the pending slot.
    pub fn accept(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.pending = None;
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl<M> Drop for Debouncer<M> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
