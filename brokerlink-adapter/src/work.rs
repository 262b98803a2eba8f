//! [`WorkScheduler`] implementations: one OS thread per unit of work, or the
//! tokio blocking pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

// ---

use tokio::runtime::Handle;

// ---

use brokerlink_domain::{BrokerError, Result, Work, WorkScheduler};

// ---------------------------------------------------------------------------
// ThreadWorkScheduler
// ---------------------------------------------------------------------------

/// Runs each unit of work on a fresh named thread.
pub struct ThreadWorkScheduler {
    // ---
    prefix: String,
    spawned: AtomicU64,
}

impl ThreadWorkScheduler {
    // ---
    pub fn new(prefix: impl Into<String>) -> Self {
        // ---
        Self {
            prefix: prefix.into(),
            spawned: AtomicU64::new(0),
        }
    }
}

impl Default for ThreadWorkScheduler {
    fn default() -> Self {
        Self::new("brokerlink-work")
    }
}

impl WorkScheduler for ThreadWorkScheduler {
    fn schedule_work(&self, work: Work) -> Result<()> {
        // ---
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("{}-{n}", self.prefix))
            .spawn(work)
            .map(|_| ())
            .map_err(|e| BrokerError::WorkRejected(format!("cannot spawn work thread: {e}")))
    }
}

// ---------------------------------------------------------------------------
// RuntimeWorkScheduler
// ---------------------------------------------------------------------------

/// Runs work on a tokio runtime's blocking pool.
///
/// Deliveries block on endpoints and broker calls, so they never run on the
/// async worker threads.
#[derive(Clone)]
pub struct RuntimeWorkScheduler {
    // ---
    handle: Handle,
}

impl RuntimeWorkScheduler {
    // ---
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime the caller is running in.
    pub fn current() -> Result<Self> {
        // ---
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| BrokerError::WorkRejected(format!("no tokio runtime: {e}")))
    }
}

impl WorkScheduler for RuntimeWorkScheduler {
    fn schedule_work(&self, work: Work) -> Result<()> {
        // ---
        // Detached: completion is observed through the worker check-in.
        drop(self.handle.spawn_blocking(work));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
