//! Global pause after throttling.
//!
//! A rate-limit or service-unavailable error sets a pause-until deadline.
//! Every pipeline calls [`PauseGate::check`] before starting network work and
//! skips the work while the gate is closed. A single timer task waits for the
//! deadline, reopens the gate and signals [`PauseGate::resumed`] once, so the
//! engine can re-drive deferred pushes and pulls.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct PauseState {
    until: Option<Instant>,
    timer_armed: bool,
}

/// Shared pause-until deadline.
#[derive(Debug, Default)]
pub struct PauseGate {
    state: Mutex<PauseState>,
    resumed: Notify,
    pauses: AtomicU64,
    resumes: AtomicU64,
}

impl PauseGate {
    /// Creates an open gate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Closes the gate for `delay`. An existing later deadline is kept.
    ///
    /// Returns the effective deadline.
    pub fn pause_for(self: &Arc<Self>, delay: Duration) -> Instant {
        let requested = Instant::now() + delay;
        let mut state = self.state.lock();
        let until = match state.until {
            Some(existing) if existing >= requested => existing,
            _ => requested,
        };
        state.until = Some(until);
        self.pauses.fetch_add(1, Ordering::SeqCst);
        info!(?delay, "pausing sync");

        if !state.timer_armed {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    state.timer_armed = true;
                    let gate = Arc::clone(self);
                    handle.spawn(async move { gate.run_timer().await });
                }
                Err(_) => warn!("no runtime for the pause timer; deadline applies without re-drive"),
            }
        }
        until
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            let deadline = self.state.lock().until;
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    tokio::time::sleep_until(deadline).await;
                }
                _ => break,
            }
        }
        {
            let mut state = self.state.lock();
            state.until = None;
            state.timer_armed = false;
        }
        self.resumes.fetch_add(1, Ordering::SeqCst);
        debug!("pause elapsed, resuming sync");
        self.resumed.notify_one();
    }

    /// Returns true while the deadline lies in the future.
    pub fn is_paused(&self) -> bool {
        self.remaining().is_some()
    }

    /// Time left until the gate reopens.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.state.lock().until?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    /// Fails with [`SyncError::Paused`] while the gate is closed.
    pub fn check(&self) -> SyncResult<()> {
        match self.remaining() {
            Some(remaining) => Err(SyncError::Paused { remaining }),
            None => Ok(()),
        }
    }

    /// Completes after the next pause elapses.
    ///
    /// A resume that happened while nobody was waiting is delivered to the
    /// next caller.
    pub async fn resumed(&self) {
        self.resumed.notified().await;
    }

    /// Number of pauses requested so far.
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::SeqCst)
    }

    /// Number of times the gate reopened after a pause.
    pub fn resume_count(&self) -> u64 {
        self.resumes.load(Ordering::SeqCst)
    }
}
