//! Cooperative cancellation.
//!
//! The build never interrupts a running tool; the flag is polled between
//! layers and between files, so cancellation takes effect at the next
//! vertex boundary and the graph is left consistent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag, cheap to clone across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the build holding this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token before a new build.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
