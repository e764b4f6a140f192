//! Module status requests.
//!
//! Scheduling a status update never waits on the bus. Each request is
//! reserved with the sender (so duplicates are refused while it is in
//! flight) and handed to a single worker task that performs the
//! send-and-wait exchanges one after another.
//!
//! Replies are applied by [`StatusListener`], which sees every `$1C` frame
//! on the bus: answers to the worker, answers to commands sent directly,
//! late answers and unsolicited ones alike.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use nikobus_core::error::{Error, Result};
use nikobus_core::{Address, BusEvent, ChannelGroup, Command, CommandKind, EventSink, Frame};
use nikobus_io::{
    protocol, AckMonitor, CommandSender, FrameFilter, FrameListener, ListenerRegistry,
    Reservation, TaskHandle,
};

use crate::module::{Module, ModuleDirectory};

/// Default retry budget of a status request.
pub const DEFAULT_STATUS_RETRY_COUNT: u32 = 10;

/// Something that can queue a status refresh for a module.
pub trait StatusRefresh: Send + Sync {
    /// Queue status requests for every used channel group of the module at
    /// `address`. `delayed` makes them wait for bus silence before writing.
    ///
    /// Returns whether any request was queued; requests equivalent to one
    /// already queued, in flight, or recently written are skipped.
    fn schedule_status_update_request(&self, address: &Address, delayed: bool) -> Result<bool>;
}

struct StatusJob {
    module: Arc<Module>,
    group: ChannelGroup,
    command: Arc<Command>,
    _reservation: Reservation,
}

/// Builds, deduplicates and queues status requests for the worker task.
pub struct StatusRequests {
    directory: Arc<dyn ModuleDirectory>,
    sender: Arc<CommandSender>,
    retry_count: u32,
    ack_timeout: Duration,
    jobs: Mutex<Option<mpsc::UnboundedSender<StatusJob>>>,
}

impl StatusRequests {
    pub fn new(
        directory: Arc<dyn ModuleDirectory>,
        sender: Arc<CommandSender>,
        retry_count: u32,
        ack_timeout: Duration,
    ) -> Self {
        StatusRequests {
            directory,
            sender,
            retry_count,
            ack_timeout,
            jobs: Mutex::new(None),
        }
    }

    /// Start the worker task. Requests scheduled before this are refused.
    pub fn spawn_worker(&self, registry: Arc<ListenerRegistry>) -> TaskHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.jobs.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(status_loop(
            rx,
            registry,
            Arc::clone(&self.sender),
            cancel.clone(),
        ));
        TaskHandle::new("status", cancel, task)
    }

    /// Stop accepting requests. Jobs already queued are dropped with the
    /// worker.
    pub fn detach(&self) {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    fn prepare(&self, command: Command, delayed: bool) -> Command {
        command
            .with_wait_for_silence(delayed)
            .with_max_retry_count(self.retry_count)
            .with_ack_timeout(self.ack_timeout)
    }
}

impl StatusRefresh for StatusRequests {
    fn schedule_status_update_request(&self, address: &Address, delayed: bool) -> Result<bool> {
        let module = self
            .directory
            .module(address)
            .ok_or_else(|| Error::UnknownModule(address.to_string()))?;

        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let Some(jobs) = jobs else {
            debug!(%address, "status worker not running, request skipped");
            return Ok(false);
        };

        let mut scheduled = false;
        for command in module.status_requests()? {
            let CommandKind::StatusRequest(group) = command.kind() else {
                continue;
            };
            let command = self.prepare(command, delayed);
            let Some(reservation) = self.sender.try_reserve(&command) else {
                trace!(%address, %group, "status request redundant, skipped");
                continue;
            };
            let job = StatusJob {
                module: Arc::clone(&module),
                group,
                command: Arc::new(command),
                _reservation: reservation,
            };
            if jobs.send(job).is_err() {
                debug!(%address, "status worker gone, request skipped");
                return Ok(scheduled);
            }
            debug!(%address, %group, delayed, "status request scheduled");
            scheduled = true;
        }
        Ok(scheduled)
    }
}

async fn status_loop(
    mut jobs: mpsc::UnboundedReceiver<StatusJob>,
    registry: Arc<ListenerRegistry>,
    sender: Arc<CommandSender>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let address = job.module.address().clone();
        let mut monitor = match AckMonitor::new(Arc::clone(&job.command)) {
            Ok(monitor) => monitor,
            Err(e) => {
                warn!(%address, error = %e, "status request without acknowledgement");
                continue;
            }
        };
        job.module.set_requested_group(job.group);
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            result = monitor.wait_for_ack(&registry, &sender) => result,
        };

        match result {
            Ok(_) => trace!(%address, group = %job.group, "status request acknowledged"),
            Err(e) => warn!(%address, group = %job.group, error = %e, "status request failed"),
        }
    }
    debug!("status worker stopped");
}

/// Applies every status reply on the bus to the module it came from.
///
/// The module is looked up in the directory when the frame arrives, so
/// modules added after registration are covered too.
pub struct StatusListener {
    directory: Arc<dyn ModuleDirectory>,
    sink: Arc<dyn EventSink>,
    events: broadcast::Sender<BusEvent>,
}

impl StatusListener {
    pub const NAME: &'static str = "module-status";

    pub fn new(
        directory: Arc<dyn ModuleDirectory>,
        sink: Arc<dyn EventSink>,
        events: broadcast::Sender<BusEvent>,
    ) -> Self {
        StatusListener {
            directory,
            sink,
            events,
        }
    }

    /// Frames this listener wants: module status replies.
    pub fn filter() -> FrameFilter {
        FrameFilter::Prefix(protocol::STATUS_RESPONSE_HEADER.to_string())
    }
}

impl FrameListener for StatusListener {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_frame(&self, frame: &Frame) {
        let Some(module) = frame.address().and_then(|a| self.directory.module(&a)) else {
            trace!(%frame, "status reply from unknown module");
            return;
        };
        let levels = match protocol::parse_status_levels(frame) {
            Ok(levels) => levels,
            Err(e) => {
                warn!(%frame, error = %e, "unreadable status reply");
                return;
            }
        };
        let group = module.requested_group();
        debug!(address = %module.address(), %group, ?levels, "module status");
        module.apply_status(group, levels, self.sink.as_ref());
        let _ = self.events.send(BusEvent::ModuleStatus {
            address: module.address().clone(),
            group,
            levels,
        });
    }
}

/// Point the module addressed by a status request at the request's group.
pub(crate) fn note_status_request(directory: &dyn ModuleDirectory, command: &Command) {
    if let CommandKind::StatusRequest(group) = command.kind() {
        if let Some(module) = directory.module(command.address()) {
            module.set_requested_group(group);
        }
    }
}
