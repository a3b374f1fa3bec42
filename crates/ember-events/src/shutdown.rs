//! Cooperative shutdown signalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide shutdown request flag.
///
/// Long-running core loops (expiry, trimming, block assembly) poll this
/// between package iterations and abort cleanly, leaving pool invariants
/// intact.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear() {
        assert!(!ShutdownFlag::new().is_requested());
    }

    #[test]
    fn request_is_sticky_and_shared() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        clone.request();
        assert!(flag.is_requested());
        flag.request();
        assert!(flag.is_requested());
    }
}
