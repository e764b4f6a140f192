//! The receiver task: reads the transport, reassembles frames and hands each
//! one to the listener registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use nikobus_core::error::Error;
use nikobus_core::transport::Transport;
use nikobus_core::{BusEvent, FrameKind};

use crate::activity::BusActivity;
use crate::protocol::FrameAssembler;
use crate::registry::ListenerRegistry;
use crate::task::TaskHandle;

/// Tuning for the receiver task.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Timeout of a single transport read. Bounds how long cancellation
    /// can go unnoticed.
    pub read_timeout: Duration,
    /// Pause after a read error before trying again.
    pub error_backoff: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            read_timeout: Duration::from_millis(100),
            error_backoff: Duration::from_millis(250),
        }
    }
}

/// Spawn the receiver task.
///
/// Button presses are additionally published on `events`.
pub fn spawn_receiver(
    transport: Arc<dyn Transport>,
    registry: Arc<ListenerRegistry>,
    activity: Arc<BusActivity>,
    events: broadcast::Sender<BusEvent>,
    config: ReceiverConfig,
) -> TaskHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(receive_loop(
        transport,
        registry,
        activity,
        events,
        config,
        cancel.clone(),
    ));
    TaskHandle::new("receiver", cancel, task)
}

async fn receive_loop(
    transport: Arc<dyn Transport>,
    registry: Arc<ListenerRegistry>,
    activity: Arc<BusActivity>,
    events: broadcast::Sender<BusEvent>,
    config: ReceiverConfig,
    cancel: CancellationToken,
) {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 256];

    loop {
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            read = transport.receive(&mut buf, config.read_timeout) => read,
        };

        match read {
            Ok(0) => {}
            Ok(n) => {
                activity.touch();
                trace!(data = ?String::from_utf8_lossy(&buf[..n]), "bytes received");
                for frame in assembler.push(&buf[..n]) {
                    debug!(%frame, "frame received");
                    if frame.kind() == FrameKind::ButtonPress {
                        if let Some(address) = frame.address() {
                            let _ = events.send(BusEvent::ButtonPressed { address });
                        }
                    }
                    registry.dispatch(&frame);
                }
            }
            Err(Error::Timeout) => {}
            Err(e) => {
                // Keep the loop alive; the engine decides when to give up.
                if matches!(e, Error::NotConnected) {
                    trace!("transport closed, waiting for connect");
                } else {
                    warn!(error = %e, "receive failed");
                }
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.error_backoff) => {}
                }
            }
        }
    }
    debug!(pending = assembler.pending(), "receiver task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nikobus_core::Frame;
    use nikobus_test_harness::MockTransport;
    use std::sync::Mutex;

    use crate::registry::{FrameFilter, FrameListener};

    struct Collect(Mutex<Vec<String>>);

    impl FrameListener for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn on_frame(&self, frame: &Frame) {
            self.0.lock().unwrap().push(frame.to_string());
        }
    }

    fn setup() -> (
        Arc<MockTransport>,
        Arc<ListenerRegistry>,
        Arc<Collect>,
        broadcast::Receiver<BusEvent>,
        TaskHandle,
    ) {
        let mock = Arc::new(MockTransport::new());
        let registry = Arc::new(ListenerRegistry::new());
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        registry.register(collect.clone(), FrameFilter::All);
        let (tx, rx) = broadcast::channel(16);
        let handle = spawn_receiver(
            mock.clone(),
            registry.clone(),
            Arc::new(BusActivity::new()),
            tx,
            ReceiverConfig::default(),
        );
        (mock, registry, collect, rx, handle)
    }

    async fn wait_for(collect: &Collect, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let seen = collect.0.lock().unwrap().clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        collect.0.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let (mock, _registry, collect, _rx, handle) = setup();
        mock.inject_chunks(&[b"$1C0E6C00FF", b"00000000FFBD45B5\r#N0D", b"1C2A\r"]);
        let seen = wait_for(&collect, 2).await;
        assert_eq!(seen, ["$1C0E6C00FF00000000FFBD45B5", "#N0D1C2A"]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn random_fragmentation_preserves_frames() {
        let (mock, _registry, collect, _rx, handle) = setup();
        mock.fragment_reads(7, 3);
        mock.inject(b"$0512\r\n#E1\r$1C221100FFFFFFFFFFFF9451E4\r");
        let seen = wait_for(&collect, 3).await;
        assert_eq!(seen, ["$0512", "#E1", "$1C221100FFFFFFFFFFFF9451E4"]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn button_press_is_published() {
        let (mock, _registry, _collect, mut rx, handle) = setup();
        mock.inject(b"#N0D1C2A\r");
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BusEvent::ButtonPressed {
                address: "0D1C2A".parse().unwrap()
            }
        );
        handle.stop().await;
    }

    #[tokio::test]
    async fn acknowledgement_reaches_waiter() {
        let (mock, registry, _collect, _rx, handle) = setup();
        let mut reg = registry.register_ack("$1C0E6C").await;
        mock.inject(b"$1C0E6C00FF00000000FFBD45B5\r");
        let frame = tokio::time::timeout(Duration::from_secs(1), reg.frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_str(), "$1C0E6C00FF00000000FFBD45B5");
        handle.stop().await;
    }

    #[tokio::test]
    async fn survives_disconnected_transport() {
        let (mock, _registry, collect, _rx, handle) = setup();
        mock.set_connected(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        mock.set_connected(true);
        mock.inject(b"#E1\r");
        assert_eq!(wait_for(&collect, 1).await, ["#E1"]);
        handle.stop().await;
    }
}
