//! The engine facade: owns the IO tasks and exposes the command surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use nikobus_core::error::{Error, Result};
use nikobus_core::{Address, BusEvent, Command, EventSink, Frame, Transport};
use nikobus_io::{
    protocol, spawn_receiver, spawn_sender, AckMonitor, BusActivity, CommandCache, CommandSender,
    FrameFilter, FrameListener, ListenerId, ListenerRegistry, ReceiverConfig, SenderConfig,
    TaskHandle,
};

use crate::module::ModuleDirectory;
use crate::scheduler::RefreshScheduler;
use crate::status::{note_status_request, StatusListener, StatusRefresh, StatusRequests};

/// Capacity of the [`BusEvent`] broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Command surface shared by the engine and anything standing in for it.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Queue `command` and wait until it has been written.
    async fn send(&self, command: Command) -> Result<()>;

    /// Write `command` and wait for the frame matching its acknowledgement
    /// pattern, retrying per the command's budget.
    async fn send_and_wait(&self, command: Command) -> Result<Frame>;
}

/// Runtime settings, filled in by [`EngineBuilder`](crate::EngineBuilder).
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub handshake: bool,
    pub receiver: ReceiverConfig,
    pub sender: SenderConfig,
    pub refresh_interval: Duration,
    pub refresh_initial_delay: Duration,
}

/// Nikobus PC-Link engine.
///
/// Construction is inert: nothing touches the transport until
/// [`start`](Self::start) and [`connect`](Self::connect) are called.
pub struct Engine {
    transport: Arc<dyn Transport>,
    registry: Arc<ListenerRegistry>,
    activity: Arc<BusActivity>,
    sender: Arc<CommandSender>,
    status: Arc<StatusRequests>,
    scheduler: Arc<RefreshScheduler>,
    directory: Arc<dyn ModuleDirectory>,
    sink: Arc<dyn EventSink>,
    events: broadcast::Sender<BusEvent>,
    config: EngineConfig,
    running: AtomicBool,
    handshake_pending: AtomicBool,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Engine {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<dyn ModuleDirectory>,
        sink: Arc<dyn EventSink>,
        cache: Arc<CommandCache>,
        status_retry_count: u32,
        status_ack_timeout: Duration,
        config: EngineConfig,
    ) -> Self {
        let sender = Arc::new(CommandSender::new(cache));
        let status = Arc::new(StatusRequests::new(
            Arc::clone(&directory),
            Arc::clone(&sender),
            status_retry_count,
            status_ack_timeout,
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&directory),
            Arc::clone(&status) as Arc<dyn StatusRefresh>,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Engine {
            transport,
            registry: Arc::new(ListenerRegistry::new()),
            activity: Arc::new(BusActivity::new()),
            sender,
            status,
            scheduler,
            directory,
            sink,
            events,
            config,
            running: AtomicBool::new(false),
            handshake_pending: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the receiver, sender, status worker and refresh scheduler, and
    /// start applying status replies to the module directory.
    ///
    /// A handshake deferred by [`connect`](Self::connect) is queued here.
    /// Calling `start` on a running engine does nothing.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("engine already running");
            return;
        }
        self.sender.resume();
        self.register_status_listener();

        tasks.push(spawn_receiver(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            Arc::clone(&self.activity),
            self.events.clone(),
            self.config.receiver.clone(),
        ));
        tasks.push(spawn_sender(
            Arc::clone(&self.transport),
            Arc::clone(&self.sender),
            Arc::clone(&self.activity),
            self.config.sender.clone(),
        ));
        tasks.push(self.status.spawn_worker(Arc::clone(&self.registry)));
        if let Some(refresh) = self
            .scheduler
            .spawn(self.config.refresh_interval, self.config.refresh_initial_delay)
        {
            tasks.push(refresh);
        }
        if self.handshake_pending.swap(false, Ordering::SeqCst) && self.transport.is_connected() {
            self.queue_handshake();
        }
        info!(port = self.transport.port_name(), "engine started");
    }

    /// Stop every task in reverse start order and close the transport.
    ///
    /// Queued commands are dropped. Calling `stop` twice is harmless.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.sender.stop();
        self.status.detach();
        while let Some(task) = tasks.pop() {
            task.stop().await;
        }
        self.registry.unregister_named(StatusListener::NAME);
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "closing transport failed");
        }
        if was_running {
            info!("engine stopped");
        }
    }

    fn register_status_listener(&self) {
        let listener = StatusListener::new(
            Arc::clone(&self.directory),
            Arc::clone(&self.sink),
            self.events.clone(),
        );
        self.registry.register(Arc::new(listener), StatusListener::filter());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Connection
    // -----------------------------------------------------------------------

    /// Open the transport and queue the PC-Link handshake.
    ///
    /// On a stopped engine the handshake waits for the next
    /// [`start`](Self::start).
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.tasks.lock().await;
        self.transport.open().await?;
        if self.config.handshake {
            if self.is_running() {
                self.queue_handshake();
            } else {
                debug!("engine stopped, handshake deferred until start");
                self.handshake_pending.store(true, Ordering::SeqCst);
            }
        }
        info!(port = self.transport.port_name(), "connected");
        let _ = self.events.send(BusEvent::Connected);
        Ok(())
    }

    fn queue_handshake(&self) {
        for command in protocol::handshake() {
            // Written in order ahead of anything queued later.
            let _ = self.sender.submit(Arc::new(command));
        }
        debug!("handshake queued");
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.handshake_pending.store(false, Ordering::SeqCst);
        self.transport.close().await?;
        info!(port = self.transport.port_name(), "disconnected");
        let _ = self.events.send(BusEvent::Disconnected);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Human-readable connection state.
    pub fn connection_status(&self) -> String {
        if self.transport.is_connected() {
            format!("Connected to {}", self.transport.port_name())
        } else {
            "Not Connected.".to_string()
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Send `command`, waiting for its acknowledgement when it expects one.
    ///
    /// Commands without an acknowledgement pattern are queued and the call
    /// returns at once. A stopped engine drops the command and returns `Ok`.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        if !self.is_running() {
            debug!(payload = command.payload(), "engine stopped, command dropped");
            return Ok(());
        }
        note_status_request(self.directory.as_ref(), &command);
        let command = Arc::new(command);
        if command.ack().is_some() {
            AckMonitor::new(command)?
                .wait_for_ack(&self.registry, &self.sender)
                .await?;
        } else {
            let _ = self.sender.submit(command);
        }
        Ok(())
    }

    /// Queue status requests for the module at `address`.
    ///
    /// See [`StatusRefresh::schedule_status_update_request`].
    pub fn schedule_status_update_request(&self, address: &Address, delayed: bool) -> Result<bool> {
        self.status.schedule_status_update_request(address, delayed)
    }

    /// Whether an equivalent command is queued, in flight, or cached.
    pub fn is_redundant(&self, command: &Command) -> bool {
        self.sender.is_redundant(command)
    }

    // -----------------------------------------------------------------------
    // Listeners and events
    // -----------------------------------------------------------------------

    pub fn register(&self, listener: Arc<dyn FrameListener>, filter: FrameFilter) -> ListenerId {
        self.registry.register(listener, filter)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.registry.unregister(id)
    }

    pub fn unregister_named(&self, name: &str) -> usize {
        self.registry.unregister_named(name)
    }

    /// Remove every caller listener. Module status keeps being tracked
    /// while the engine runs.
    pub fn unregister_all(&self) {
        self.registry.unregister_all();
        if self.is_running() {
            self.register_status_listener();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<dyn ModuleDirectory> {
        &self.directory
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[async_trait]
impl ProtocolEngine for Engine {
    async fn send(&self, command: Command) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        note_status_request(self.directory.as_ref(), &command);
        self.sender.submit(Arc::new(command)).written().await
    }

    async fn send_and_wait(&self, command: Command) -> Result<Frame> {
        if !self.is_running() {
            return Err(Error::Stopped);
        }
        note_status_request(self.directory.as_ref(), &command);
        AckMonitor::new(Arc::new(command))?
            .wait_for_ack(&self.registry, &self.sender)
            .await
    }
}

impl StatusRefresh for Engine {
    fn schedule_status_update_request(&self, address: &Address, delayed: bool) -> Result<bool> {
        self.status.schedule_status_update_request(address, delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use nikobus_core::{ChannelGroup, ModuleKind};
    use nikobus_test_harness::MockTransport;

    use crate::builder::EngineBuilder;
    use crate::module::{Module, ModuleRegistry};

    const REPLY: &[u8] = b"$1C0E6C000000FF80000087F34E\r";

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<(String, u8)>>);

    impl EventSink for Recorder {
        fn post_update(&self, item: &str, value: u8) {
            self.0.lock().unwrap().push((item.to_string(), value));
        }
    }

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn status_request(timeout_ms: u64, retries: u32) -> Command {
        protocol::status_request(&addr("6C0E"), ChannelGroup::One)
            .unwrap()
            .with_ack_timeout(Duration::from_millis(timeout_ms))
            .with_max_retry_count(retries)
    }

    fn engine(mock: &Arc<MockTransport>) -> Engine {
        EngineBuilder::new()
            .handshake(false)
            .refresh_interval(Duration::ZERO)
            .build_with_transport(mock.clone())
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn acknowledged_command_succeeds_and_clears_waiter() {
        let mock = Arc::new(MockTransport::new());
        mock.reply_to(b"$10120E6C", REPLY);
        let engine = engine(&mock);
        engine.start().await;

        engine.send_command(status_request(500, 3)).await.unwrap();
        assert_eq!(mock.sent_count(), 1);
        assert_eq!(engine.registry().pending_acks(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn missing_ack_times_out_after_all_attempts() {
        let mock = Arc::new(MockTransport::new());
        let engine = engine(&mock);
        engine.start().await;

        let result = engine.send_command(status_request(30, 3)).await;
        assert!(matches!(
            result,
            Err(Error::AckTimeout { attempts: 4, .. })
        ));
        assert_eq!(mock.sent_count_with_prefix(b"$10120E6C"), 4);
        assert_eq!(engine.registry().pending_acks(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn command_without_ack_returns_immediately() {
        let mock = Arc::new(MockTransport::new());
        let engine = engine(&mock);
        engine.start().await;

        let press = protocol::button_press(&addr("0D1C2A")).unwrap();
        engine.send_command(press).await.unwrap();
        wait_until(|| mock.sent_count() == 1).await;
        assert_eq!(mock.sent_frames(), ["#N0D1C2A"]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn stopped_engine_writes_nothing() {
        let mock = Arc::new(MockTransport::new());
        let engine = engine(&mock);
        engine.start().await;
        engine.stop().await;
        engine.stop().await;

        engine.send_command(status_request(30, 3)).await.unwrap();
        engine
            .send_command(protocol::button_press(&addr("0D1C2A")).unwrap())
            .await
            .unwrap();
        assert_eq!(mock.sent_count(), 0);
        assert!(matches!(
            engine.send(Command::new(addr("0000"), nikobus_core::CommandKind::Raw, "#E1")).await,
            Err(Error::Stopped)
        ));
    }

    #[tokio::test]
    async fn duplicate_status_requests_write_once() {
        let mock = Arc::new(MockTransport::new());
        mock.reply_to(b"$10120E6C", REPLY);
        let modules = Arc::new(ModuleRegistry::new());
        modules.add(
            Module::new(addr("6C0E"), ModuleKind::Dimmer)
                .with_channel(3, "kitchen")
                .unwrap(),
        );
        let engine = EngineBuilder::new()
            .handshake(false)
            .refresh_interval(Duration::ZERO)
            .modules(modules)
            .build_with_transport(mock.clone())
            .unwrap();
        engine.start().await;

        assert!(engine.schedule_status_update_request(&addr("6C0E"), false).unwrap());
        assert!(!engine.schedule_status_update_request(&addr("6C0E"), false).unwrap());

        let mut events = engine.subscribe();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, BusEvent::ModuleStatus { .. }));

        // Still cached after the exchange.
        assert!(!engine.schedule_status_update_request(&addr("6C0E"), false).unwrap());
        assert_eq!(mock.sent_count_with_prefix(b"$10120E6C"), 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn status_reply_updates_module_and_sink() {
        let mock = Arc::new(MockTransport::new());
        mock.reply_to(b"$10120E6C", REPLY);
        let modules = Arc::new(ModuleRegistry::new());
        let module = modules.add(
            Module::new(addr("6C0E"), ModuleKind::Dimmer)
                .with_channel(3, "kitchen")
                .unwrap()
                .with_channel(4, "dining")
                .unwrap(),
        );
        let sink = Arc::new(Recorder::default());
        let engine = EngineBuilder::new()
            .handshake(false)
            .refresh_interval(Duration::ZERO)
            .modules(modules)
            .event_sink(sink.clone())
            .build_with_transport(mock.clone())
            .unwrap();
        let mut events = engine.subscribe();
        engine.start().await;

        engine
            .schedule_status_update_request(&addr("6C0E"), false)
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BusEvent::ModuleStatus {
                address: addr("6C0E"),
                group: ChannelGroup::One,
                levels: [0x00, 0x00, 0xFF, 0x80, 0x00, 0x00],
            }
        );
        assert_eq!(
            *sink.0.lock().unwrap(),
            [("kitchen".to_string(), 0xFF), ("dining".to_string(), 0x80)]
        );
        assert_eq!(module.level(3), Some(0xFF));
        engine.stop().await;
    }

    #[tokio::test]
    async fn unknown_module_is_reported() {
        let mock = Arc::new(MockTransport::new());
        let engine = engine(&mock);
        engine.start().await;
        assert!(matches!(
            engine.schedule_status_update_request(&addr("ABCD"), true),
            Err(Error::UnknownModule(_))
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn connect_sends_handshake_and_reports_status() {
        let mock = Arc::new(MockTransport::new());
        mock.set_connected(false);
        let engine = EngineBuilder::new()
            .refresh_interval(Duration::ZERO)
            .build_with_transport(mock.clone())
            .unwrap();
        assert_eq!(engine.connection_status(), "Not Connected.");

        let mut events = engine.subscribe();
        engine.start().await;
        engine.connect().await.unwrap();
        assert_eq!(engine.connection_status(), "Connected to mock");
        assert_eq!(events.recv().await.unwrap(), BusEvent::Connected);

        wait_until(|| mock.sent_count() == protocol::HANDSHAKE.len()).await;
        assert_eq!(mock.sent_frames(), protocol::HANDSHAKE);

        engine.disconnect().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), BusEvent::Disconnected);
        assert_eq!(engine.connection_status(), "Not Connected.");
        engine.stop().await;
    }

    #[tokio::test]
    async fn connect_failure_is_returned() {
        let mock = Arc::new(MockTransport::new());
        mock.set_connected(false);
        mock.fail_open(true);
        let engine = engine(&mock);
        assert!(engine.connect().await.is_err());
    }

    #[tokio::test]
    async fn send_and_wait_returns_ack_frame() {
        let mock = Arc::new(MockTransport::new());
        mock.reply_to(b"$10120E6C", REPLY);
        let engine = engine(&mock);
        engine.start().await;

        let frame = engine.send_and_wait(status_request(500, 0)).await.unwrap();
        assert_eq!(frame.as_str(), "$1C0E6C000000FF80000087F34E");
        engine.stop().await;
    }

    #[tokio::test]
    async fn replies_outside_the_worker_update_modules() {
        let mock = Arc::new(MockTransport::new());
        mock.reply_to(b"$10120E6C", REPLY);
        let modules = Arc::new(ModuleRegistry::new());
        let module = modules.add(
            Module::new(addr("6C0E"), ModuleKind::Dimmer)
                .with_channel(3, "kitchen")
                .unwrap(),
        );
        let sink = Arc::new(Recorder::default());
        let engine = EngineBuilder::new()
            .handshake(false)
            .refresh_interval(Duration::ZERO)
            .modules(modules)
            .event_sink(sink.clone())
            .build_with_transport(mock.clone())
            .unwrap();
        engine.start().await;

        // Direct request: acknowledged, and the reply reaches the module.
        engine.send_command(status_request(500, 3)).await.unwrap();
        wait_until(|| sink.0.lock().unwrap().len() == 1).await;
        assert_eq!(*sink.0.lock().unwrap(), [("kitchen".to_string(), 0xFF)]);
        assert_eq!(module.level(3), Some(0xFF));

        // Unsolicited push with nobody waiting for it.
        mock.inject(b"$1C0E6C00FF00000000FFBD45B5\r");
        wait_until(|| sink.0.lock().unwrap().len() == 2).await;
        assert_eq!(sink.0.lock().unwrap()[1], ("kitchen".to_string(), 0x00));
        assert_eq!(module.level(2), Some(0x00));
        assert_eq!(module.level(1), Some(0xFF));
        assert_eq!(engine.registry().pending_acks(), 0);

        // Caller listeners can be cleared without losing module tracking.
        engine.unregister_all();
        mock.inject(b"$1C0E6C000000FF80000087F34E\r");
        wait_until(|| sink.0.lock().unwrap().len() == 3).await;
        assert_eq!(module.level(3), Some(0xFF));
        engine.stop().await;
        assert_eq!(engine.registry().listener_count(), 0);
    }

    #[tokio::test]
    async fn handshake_survives_connect_while_stopped() {
        let mock = Arc::new(MockTransport::new());
        mock.set_connected(false);
        let engine = EngineBuilder::new()
            .refresh_interval(Duration::ZERO)
            .build_with_transport(mock.clone())
            .unwrap();

        engine.start().await;
        engine.stop().await;
        engine.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.sent_count(), 0);

        engine.start().await;
        wait_until(|| mock.sent_count() == protocol::HANDSHAKE.len()).await;
        assert_eq!(mock.sent_frames(), protocol::HANDSHAKE);

        // A second start does not repeat it.
        engine.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.sent_count(), protocol::HANDSHAKE.len());
        engine.stop().await;
    }

    #[tokio::test]
    async fn disconnect_cancels_deferred_handshake() {
        let mock = Arc::new(MockTransport::new());
        mock.set_connected(false);
        let engine = EngineBuilder::new()
            .refresh_interval(Duration::ZERO)
            .build_with_transport(mock.clone())
            .unwrap();

        engine.connect().await.unwrap();
        engine.disconnect().await.unwrap();
        engine.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mock.sent_count(), 0);
        engine.stop().await;
    }

    struct Named(&'static str);

    impl FrameListener for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn on_frame(&self, _frame: &Frame) {}
    }

    #[tokio::test]
    async fn listener_registration_passthrough() {
        let mock = Arc::new(MockTransport::new());
        let engine = engine(&mock);
        let id = engine.register(Arc::new(Named("a")), FrameFilter::All);
        engine.register(Arc::new(Named("b")), FrameFilter::Prefix("#N".into()));
        engine.register(Arc::new(Named("b")), FrameFilter::All);
        assert!(engine.unregister(id));
        assert_eq!(engine.unregister_named("b"), 2);
        engine.unregister_all();
        assert_eq!(engine.registry().listener_count(), 0);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let mock = Arc::new(MockTransport::new());
        let engine = engine(&mock);
        engine.start().await;
        engine.stop().await;
        mock.set_connected(true);
        engine.start().await;
        assert!(engine.is_running());
        engine
            .send(protocol::button_press(&addr("0D1C2A")).unwrap())
            .await
            .unwrap();
        assert_eq!(mock.sent_count(), 1);
        engine.stop().await;
    }
}
