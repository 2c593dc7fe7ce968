//! An error sink that remembers what it was given.

use parking_lot::Mutex;
use skysync_engine::{ErrorModule, ErrorSink, SyncError};

/// Collects reported errors as `(module, message)` pairs.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    errors: Mutex<Vec<(ErrorModule, String)>>,
}

impl CollectingErrorSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reported error so far.
    pub fn errors(&self) -> Vec<(ErrorModule, String)> {
        self.errors.lock().clone()
    }

    /// Number of reported errors.
    pub fn count(&self) -> usize {
        self.errors.lock().len()
    }

    /// Number of errors reported by one module.
    pub fn count_for(&self, module: ErrorModule) -> usize {
        self.errors.lock().iter().filter(|(m, _)| *m == module).count()
    }

    /// Returns true if a reported message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.errors.lock().iter().any(|(_, m)| m.contains(needle))
    }

    /// Forgets every reported error.
    pub fn clear(&self) {
        self.errors.lock().clear();
    }
}

impl ErrorSink for CollectingErrorSink {
    fn report(&self, error: &SyncError, module: ErrorModule) {
        self.errors.lock().push((module, error.to_string()));
    }
}
