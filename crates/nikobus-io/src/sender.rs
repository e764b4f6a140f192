//! Outbound command queue and the writer task that drains it.
//!
//! Commands are written strictly in submission order by a single task. Each
//! submission resolves once its bytes hit the transport (or the write fails),
//! which is the moment an acknowledgement timeout should start counting.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use nikobus_core::error::{Error, Result};
use nikobus_core::transport::Transport;
use nikobus_core::{Command, RedundancyKey};

use crate::activity::BusActivity;
use crate::cache::CommandCache;
use crate::protocol;
use crate::task::TaskHandle;

/// Default minimum bus silence before a silence-waiting command is written.
pub const DEFAULT_QUIET_INTERVAL: Duration = Duration::from_millis(500);

/// Default upper bound on the wait for bus silence.
pub const DEFAULT_SILENCE_MAX_WAIT: Duration = Duration::from_secs(10);

/// Tuning for the writer task.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Silence required before writing a command that asks for it.
    pub quiet_interval: Duration,
    /// Longest wait for that silence before writing anyway.
    pub silence_max_wait: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            quiet_interval: DEFAULT_QUIET_INTERVAL,
            silence_max_wait: DEFAULT_SILENCE_MAX_WAIT,
        }
    }
}

struct Outgoing {
    command: Arc<Command>,
    written: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<Outgoing>,
    reserved: HashMap<RedundancyKey, usize>,
}

/// Resolves when the command has been written, or why it never was.
#[must_use = "a submission does nothing unless awaited or dropped deliberately"]
pub struct Submission {
    rx: oneshot::Receiver<Result<()>>,
}

impl Submission {
    /// Wait for the write. A command dropped by [`CommandSender::stop`]
    /// resolves to [`Error::Stopped`].
    pub async fn written(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(Error::Stopped))
    }
}

/// A claim on a redundancy key held while a command is in flight.
///
/// While alive, [`CommandSender::is_redundant`] reports equivalent commands
/// as redundant even before the first one reaches the queue.
pub struct Reservation {
    sender: Arc<CommandSender>,
    key: RedundancyKey,
}

impl Reservation {
    pub fn key(&self) -> &RedundancyKey {
        &self.key
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.sender.release(&self.key);
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").field("key", &self.key).finish()
    }
}

/// FIFO queue of commands waiting for the writer task.
pub struct CommandSender {
    state: Mutex<SendState>,
    queued: Notify,
    cache: Arc<CommandCache>,
    stopped: AtomicBool,
}

impl CommandSender {
    pub fn new(cache: Arc<CommandCache>) -> Self {
        CommandSender {
            state: Mutex::new(SendState::default()),
            queued: Notify::new(),
            cache,
            stopped: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SendState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn cache(&self) -> &Arc<CommandCache> {
        &self.cache
    }

    /// Queue `command` for writing.
    ///
    /// After [`stop`](Self::stop) the command is dropped and the submission
    /// resolves to [`Error::Stopped`].
    pub fn submit(&self, command: Arc<Command>) -> Submission {
        let (written, rx) = oneshot::channel();
        if self.stopped.load(Ordering::SeqCst) {
            debug!(payload = command.payload(), "sender stopped, dropping command");
            return Submission { rx };
        }
        trace!(payload = command.payload(), "command queued");
        self.lock().queue.push_back(Outgoing { command, written });
        self.queued.notify_one();
        Submission { rx }
    }

    /// Whether an equivalent command is queued, reserved, or was written
    /// within the cache TTL.
    pub fn is_redundant(&self, command: &Command) -> bool {
        let key = command.redundancy_key();
        let state = self.lock();
        Self::redundant_locked(&state, &self.cache, &key)
    }

    fn redundant_locked(state: &SendState, cache: &CommandCache, key: &RedundancyKey) -> bool {
        state.reserved.contains_key(key)
            || state
                .queue
                .iter()
                .any(|out| &out.command.redundancy_key() == key)
            || cache.contains(key)
    }

    /// Atomically check redundancy and claim the command's key.
    ///
    /// Returns `None` if the command is redundant.
    pub fn try_reserve(self: &Arc<Self>, command: &Command) -> Option<Reservation> {
        let key = command.redundancy_key();
        let mut state = self.lock();
        if Self::redundant_locked(&state, &self.cache, &key) {
            return None;
        }
        *state.reserved.entry(key.clone()).or_insert(0) += 1;
        Some(Reservation {
            sender: Arc::clone(self),
            key,
        })
    }

    fn release(&self, key: &RedundancyKey) {
        let mut state = self.lock();
        if let Some(count) = state.reserved.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                state.reserved.remove(key);
            }
        }
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Reject new submissions and drop everything still queued.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let dropped = std::mem::take(&mut self.lock().queue);
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping queued commands");
        }
    }

    /// Accept submissions again after [`stop`](Self::stop).
    pub fn resume(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn next(&self) -> Outgoing {
        loop {
            let next = self.lock().queue.pop_front();
            if let Some(outgoing) = next {
                return outgoing;
            }
            self.queued.notified().await;
        }
    }
}

impl fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CommandSender")
            .field("queued", &state.queue.len())
            .field("reserved", &state.reserved.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Spawn the task that writes queued commands to `transport`.
pub fn spawn_sender(
    transport: Arc<dyn Transport>,
    sender: Arc<CommandSender>,
    activity: Arc<BusActivity>,
    config: SenderConfig,
) -> TaskHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(send_loop(
        transport,
        sender,
        activity,
        config,
        cancel.clone(),
    ));
    TaskHandle::new("sender", cancel, task)
}

async fn send_loop(
    transport: Arc<dyn Transport>,
    sender: Arc<CommandSender>,
    activity: Arc<BusActivity>,
    config: SenderConfig,
    cancel: CancellationToken,
) {
    loop {
        let Outgoing { command, written } = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            outgoing = sender.next() => outgoing,
        };

        if command.wait_for_silence() {
            let quiet = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let _ = written.send(Err(Error::Stopped));
                    break;
                }
                quiet = activity.wait_for_silence(config.quiet_interval, config.silence_max_wait) => quiet,
            };
            if !quiet {
                warn!(
                    payload = command.payload(),
                    "bus not quiet after {:?}, writing anyway",
                    config.silence_max_wait
                );
            }
        }

        let result = transport.send(&protocol::encode(&command)).await;
        match &result {
            Ok(()) => {
                activity.touch();
                sender
                    .cache()
                    .record(command.redundancy_key(), Arc::clone(&command), Instant::now());
                debug!(payload = command.payload(), "command written");
            }
            Err(e) => warn!(payload = command.payload(), error = %e, "command write failed"),
        }
        let _ = written.send(result);
    }
    debug!("sender task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nikobus_core::{ChannelGroup, CommandKind};
    use nikobus_test_harness::MockTransport;

    fn status(address: &str) -> Command {
        protocol::status_request(&address.parse().unwrap(), ChannelGroup::One).unwrap()
    }

    fn raw(payload: &str) -> Arc<Command> {
        Arc::new(Command::new(
            "0000".parse().unwrap(),
            CommandKind::Raw,
            payload,
        ))
    }

    fn setup() -> (Arc<MockTransport>, Arc<CommandSender>, TaskHandle) {
        let mock = Arc::new(MockTransport::new());
        let sender = Arc::new(CommandSender::new(Arc::new(CommandCache::default())));
        let handle = spawn_sender(
            mock.clone(),
            sender.clone(),
            Arc::new(BusActivity::new()),
            SenderConfig::default(),
        );
        (mock, sender, handle)
    }

    #[tokio::test]
    async fn writes_in_submission_order() {
        let (mock, sender, handle) = setup();
        let a = sender.submit(raw("#L0"));
        let b = sender.submit(raw("#E0"));
        let c = sender.submit(raw("#E1"));
        a.written().await.unwrap();
        b.written().await.unwrap();
        c.written().await.unwrap();
        assert_eq!(mock.sent_frames(), ["#L0", "#E0", "#E1"]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn written_command_is_cached() {
        let (_mock, sender, handle) = setup();
        let cmd = Arc::new(status("6C0E"));
        assert!(!sender.is_redundant(&cmd));
        sender.submit(cmd.clone()).written().await.unwrap();
        assert!(sender.is_redundant(&cmd));
        handle.stop().await;
    }

    #[tokio::test]
    async fn queued_command_is_redundant() {
        let sender = CommandSender::new(Arc::new(CommandCache::default()));
        let cmd = Arc::new(status("6C0E"));
        let _pending = sender.submit(cmd.clone());
        assert!(sender.is_redundant(&cmd));
        assert!(!sender.is_redundant(&status("2211")));
    }

    #[test]
    fn reservation_blocks_until_dropped() {
        let sender = Arc::new(CommandSender::new(Arc::new(CommandCache::default())));
        let cmd = status("6C0E");
        let reservation = sender.try_reserve(&cmd).unwrap();
        assert!(sender.try_reserve(&cmd).is_none());
        assert!(sender.is_redundant(&cmd));
        drop(reservation);
        assert!(sender.try_reserve(&cmd).is_some());
    }

    #[tokio::test]
    async fn write_failure_reaches_submitter() {
        let (mock, sender, handle) = setup();
        mock.set_connected(false);
        let result = sender.submit(raw("#E1")).written().await;
        assert!(matches!(result, Err(Error::NotConnected)));
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_drops_queue_and_rejects_new_commands() {
        let sender = CommandSender::new(Arc::new(CommandCache::default()));
        let queued = sender.submit(raw("#E1"));
        sender.stop();
        assert_eq!(sender.queue_len(), 0);
        assert!(matches!(queued.written().await, Err(Error::Stopped)));
        assert!(matches!(
            sender.submit(raw("#E0")).written().await,
            Err(Error::Stopped)
        ));
        sender.resume();
        let _accepted = sender.submit(raw("#E0"));
        assert_eq!(sender.queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_waiting_command_waits_for_quiet_bus() {
        let mock = Arc::new(MockTransport::new());
        let sender = Arc::new(CommandSender::new(Arc::new(CommandCache::default())));
        let activity = Arc::new(BusActivity::new());
        let handle = spawn_sender(
            mock.clone(),
            sender.clone(),
            activity.clone(),
            SenderConfig::default(),
        );

        activity.touch();
        let start = Instant::now();
        let cmd = Arc::new(status("6C0E").with_wait_for_silence(true));
        sender.submit(cmd).written().await.unwrap();
        assert!(start.elapsed() >= DEFAULT_QUIET_INTERVAL);
        assert_eq!(mock.sent_count(), 1);
        handle.stop().await;
    }
}
