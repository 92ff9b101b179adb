//! Level-triggered configuration change signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shared flag raised whenever configuration changed on disk.
///
/// Any number of `set` calls between two `take` calls collapse into a single
/// reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReloadLatch {
    flag: Arc<AtomicBool>,
}

impl ReloadLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Clear the latch, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}
