//! Periodic round-robin status refresh.
//!
//! Each tick refreshes exactly one module, so a full sweep of N modules
//! takes N intervals and the bus never sees a burst of status requests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use nikobus_core::Address;
use nikobus_io::TaskHandle;

use crate::module::ModuleDirectory;
use crate::status::StatusRefresh;

/// Default time between two ticks.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// Default delay before the first tick.
pub const DEFAULT_REFRESH_INITIAL_DELAY: Duration = Duration::from_secs(600);

pub struct RefreshScheduler {
    directory: Arc<dyn ModuleDirectory>,
    refresh: Arc<dyn StatusRefresh>,
    next: Mutex<usize>,
}

impl RefreshScheduler {
    pub fn new(directory: Arc<dyn ModuleDirectory>, refresh: Arc<dyn StatusRefresh>) -> Self {
        RefreshScheduler {
            directory,
            refresh,
            next: Mutex::new(0),
        }
    }

    /// Request a delayed status refresh of the next module in turn.
    ///
    /// Returns the module picked, or `None` when there are no modules.
    pub fn tick(&self) -> Option<Address> {
        let modules = self.directory.modules();
        if modules.is_empty() {
            trace!("no modules to refresh");
            return None;
        }

        let address = {
            let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
            if *next >= modules.len() {
                *next = 0;
            }
            let address = modules[*next].address().clone();
            *next += 1;
            address
        };

        match self.refresh.schedule_status_update_request(&address, true) {
            Ok(true) => debug!(%address, "refresh scheduled"),
            Ok(false) => trace!(%address, "refresh not needed"),
            Err(e) => warn!(%address, error = %e, "refresh failed"),
        }
        Some(address)
    }

    /// Run [`tick`](Self::tick) every `interval` after `initial_delay`.
    ///
    /// Returns `None` without spawning when `interval` is zero.
    pub fn spawn(self: &Arc<Self>, interval: Duration, initial_delay: Duration) -> Option<TaskHandle> {
        if interval.is_zero() {
            debug!("status refresh disabled");
            return None;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(
            Arc::clone(self),
            interval,
            initial_delay,
            cancel.clone(),
        ));
        Some(TaskHandle::new("refresh", cancel, task))
    }
}

async fn refresh_loop(
    scheduler: Arc<RefreshScheduler>,
    interval: Duration,
    initial_delay: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(initial_delay) => {}
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                scheduler.tick();
            }
        }
    }
    debug!("refresh scheduler stopped");
}
