//! Bus traffic tracking.
//!
//! Both the receiver and the sender touch the shared [`BusActivity`] whenever
//! bytes cross the wire. Commands that ask for silence wait on it before they
//! are written.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
pub struct BusActivity {
    last: Mutex<Option<Instant>>,
}

impl BusActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic now.
    pub fn touch(&self) {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        *last = Some(Instant::now());
    }

    pub fn last_activity(&self) -> Option<Instant> {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Time since the last recorded traffic, or `Duration::MAX` if none.
    pub fn quiet_for(&self) -> Duration {
        self.last_activity()
            .map_or(Duration::MAX, |last| last.elapsed())
    }

    /// Wait until the bus has been quiet for at least `quiet`.
    ///
    /// Gives up after `max_wait` and returns `false`; the caller then writes
    /// anyway.
    pub async fn wait_for_silence(&self, quiet: Duration, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let quiet_for = self.quiet_for();
            if quiet_for >= quiet {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(?quiet_for, "bus still busy at silence deadline");
                return false;
            }
            let wake = (now + (quiet - quiet_for)).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }
}
