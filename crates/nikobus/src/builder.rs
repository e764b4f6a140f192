//! EngineBuilder -- fluent builder for constructing [`Engine`] instances.
//!
//! Every setting has a default that suits a standard PC-Link, so the
//! simplest usage only names the serial port:
//!
//! ```no_run
//! use nikobus::EngineBuilder;
//!
//! # async fn example() -> nikobus::Result<()> {
//! let engine = EngineBuilder::new().serial_port("/dev/ttyUSB0").build()?;
//! engine.start().await;
//! engine.connect().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use nikobus_core::command::DEFAULT_ACK_TIMEOUT;
use nikobus_core::error::{Error, Result};
use nikobus_core::{EventSink, NullSink, Transport};
use nikobus_io::{CommandCache, ReceiverConfig, SenderConfig, DEFAULT_CACHE_TTL};
use nikobus_transport::{SerialTransport, DEFAULT_BAUD_RATE};

use crate::engine::{Engine, EngineConfig};
use crate::module::{ModuleDirectory, ModuleRegistry};
use crate::scheduler::{DEFAULT_REFRESH_INITIAL_DELAY, DEFAULT_REFRESH_INTERVAL};
use crate::status::DEFAULT_STATUS_RETRY_COUNT;

/// Fluent builder for [`Engine`].
pub struct EngineBuilder {
    serial_port: Option<String>,
    baud_rate: u32,
    cache_ttl: Duration,
    receiver: ReceiverConfig,
    sender: SenderConfig,
    status_retry_count: u32,
    status_ack_timeout: Duration,
    refresh_interval: Duration,
    refresh_initial_delay: Duration,
    handshake: bool,
    sink: Arc<dyn EventSink>,
    directory: Option<Arc<dyn ModuleDirectory>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder {
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            cache_ttl: DEFAULT_CACHE_TTL,
            receiver: ReceiverConfig::default(),
            sender: SenderConfig::default(),
            status_retry_count: DEFAULT_STATUS_RETRY_COUNT,
            status_ack_timeout: DEFAULT_ACK_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            refresh_initial_delay: DEFAULT_REFRESH_INITIAL_DELAY,
            handshake: true,
            sink: Arc::new(NullSink),
            directory: None,
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the PC-Link baud rate (default: 9600).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// How long a written command suppresses equivalent ones (default: 2s).
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Bus silence required before delayed commands (default: 500ms).
    pub fn quiet_interval(mut self, interval: Duration) -> Self {
        self.sender.quiet_interval = interval;
        self
    }

    /// Longest wait for bus silence before writing anyway (default: 10s).
    pub fn silence_max_wait(mut self, max_wait: Duration) -> Self {
        self.sender.silence_max_wait = max_wait;
        self
    }

    /// Retry budget of status requests (default: 10).
    pub fn status_retry_count(mut self, count: u32) -> Self {
        self.status_retry_count = count;
        self
    }

    /// Per-attempt acknowledgement timeout of status requests (default: 2s).
    pub fn status_ack_timeout(mut self, timeout: Duration) -> Self {
        self.status_ack_timeout = timeout;
        self
    }

    /// Time between two module refreshes; zero disables (default: 600s).
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Delay before the first module refresh (default: 600s).
    pub fn refresh_initial_delay(mut self, delay: Duration) -> Self {
        self.refresh_initial_delay = delay;
        self
    }

    /// Timeout of a single transport read (default: 100ms).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.receiver.read_timeout = timeout;
        self
    }

    /// Send the PC-Link initialisation sequence on connect (default: on).
    pub fn handshake(mut self, enabled: bool) -> Self {
        self.handshake = enabled;
        self
    }

    /// Where decoded output levels are posted (default: dropped).
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Modules to poll (default: an empty [`ModuleRegistry`]).
    pub fn modules(mut self, directory: Arc<dyn ModuleDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Build an [`Engine`] with a caller-provided transport.
    ///
    /// This is the entry point for testing (pass a `MockTransport` from
    /// `nikobus-test-harness`) and for callers that manage their own
    /// transport.
    pub fn build_with_transport(self, transport: Arc<dyn Transport>) -> Result<Engine> {
        if self.receiver.read_timeout.is_zero() {
            return Err(Error::InvalidParameter("read_timeout must be non-zero".into()));
        }
        if self.status_ack_timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "status_ack_timeout must be non-zero".into(),
            ));
        }

        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(ModuleRegistry::new()) as Arc<dyn ModuleDirectory>);
        let config = EngineConfig {
            handshake: self.handshake,
            receiver: self.receiver,
            sender: self.sender,
            refresh_interval: self.refresh_interval,
            refresh_initial_delay: self.refresh_initial_delay,
        };

        Ok(Engine::new(
            transport,
            directory,
            self.sink,
            Arc::new(CommandCache::new(self.cache_ttl)),
            self.status_retry_count,
            self.status_ack_timeout,
            config,
        ))
    }

    /// Build an [`Engine`] on an unopened serial transport.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    /// The port is opened by [`Engine::connect`].
    pub fn build(self) -> Result<Engine> {
        let port = self
            .serial_port
            .as_deref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;
        if self.baud_rate == 0 {
            return Err(Error::InvalidParameter("baud_rate must be non-zero".into()));
        }
        let transport = SerialTransport::new(port, self.baud_rate);
        self.build_with_transport(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nikobus_test_harness::MockTransport;

    #[test]
    fn build_requires_serial_port() {
        let result = EngineBuilder::new().build();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn build_rejects_zero_baud() {
        let result = EngineBuilder::new()
            .serial_port("/dev/ttyUSB0")
            .baud_rate(0)
            .build();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn build_is_inert() {
        let engine = EngineBuilder::new()
            .serial_port("/dev/nonexistent-nikobus")
            .build()
            .unwrap();
        assert!(!engine.is_running());
        assert!(!engine.is_connected());
        assert_eq!(engine.connection_status(), "Not Connected.");
        assert_eq!(engine.transport().port_name(), "/dev/nonexistent-nikobus");
    }

    #[test]
    fn zero_read_timeout_rejected() {
        let result = EngineBuilder::new()
            .read_timeout(Duration::ZERO)
            .build_with_transport(Arc::new(MockTransport::new()));
        assert!(result.is_err());
    }

    #[test]
    fn default_directory_is_empty() {
        let engine = EngineBuilder::new()
            .build_with_transport(Arc::new(MockTransport::new()))
            .unwrap();
        assert!(engine.directory().modules().is_empty());
    }
}
