//! Cooperative cancellation signal
//!
//! Cancellation in the pipeline is a polled flag, not preemption: setting the
//! signal takes effect at the next safe point (between captured frames, before
//! commit points). A blocking inference or playback call already in flight is
//! never interrupted, so cancellation latency is bounded by the longest
//! blocking call rather than zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared set-once stop flag, safe to set from any thread any number of times
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create a new, unset signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent_and_shared() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_set());

        clone.set();
        clone.set();
        assert!(signal.is_set());
        assert!(clone.is_set());
    }
}
