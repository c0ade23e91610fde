//! Per-query session state visible to operators.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quern_error::{QuernError, Result};

/// Cooperative cancellation handle for one query execution.
///
/// Operators poll the kill flag between rows and between state transitions;
/// no blocking work is started once the flag is observed set. The flag may
/// be set from any thread.
#[derive(Debug, Default)]
pub struct Session {
    killed: AtomicBool,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request cancellation of the running query.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Poll the kill flag, turning a set flag into an error.
    pub fn check_killed(&self) -> Result<()> {
        if self.is_killed() {
            Err(QuernError::Killed)
        } else {
            Ok(())
        }
    }
}
