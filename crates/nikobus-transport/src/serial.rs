//! Serial port transport for the Nikobus PC-Link.
//!
//! The PC-Link shows up as an RS-232 or USB virtual COM port. Only the baud
//! rate is configurable; the line is always 8 data bits, no parity, one stop
//! bit and no flow control.
//!
//! The stream is split into read and write halves so the receiver task can
//! sit in a bounded read while the sender task writes a command.
//!
//! # Example
//!
//! ```no_run
//! use nikobus_transport::{SerialTransport, DEFAULT_BAUD_RATE};
//! use nikobus_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> nikobus_core::Result<()> {
//! let transport = SerialTransport::new("/dev/ttyUSB0", DEFAULT_BAUD_RATE);
//! transport.open().await?;
//! transport.send(b"#E1\r").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nikobus_core::error::{Error, Result};
use nikobus_core::transport::Transport;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, error, info, trace, warn};

/// Baud rate of the Nikobus PC-Link.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Serial port transport to the PC-Link.
///
/// Created closed; [`Transport::open`] opens the port and may be called
/// again after [`Transport::close`] to reconnect.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    reader: Mutex<Option<ReadHalf<SerialStream>>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    connected: AtomicBool,
}

impl SerialTransport {
    /// Create a closed transport for `port` (e.g. `/dev/ttyUSB0`, `COM3`).
    pub fn new(port: &str, baud_rate: u32) -> Self {
        SerialTransport {
            port_name: port.to_string(),
            baud_rate,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| Error::Transport(format!("cannot enumerate serial ports: {e}")))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        if reader.is_some() && writer.is_some() {
            return Ok(());
        }

        debug!(port = %self.port_name, baud_rate = self.baud_rate, "opening PC-Link port");
        let stream = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                error!(port = %self.port_name, error = %e, "cannot open PC-Link port");
                Error::Transport(format!("cannot open {}: {e}", self.port_name))
            })?;

        let (read_half, write_half) = tokio::io::split(stream);
        *reader = Some(read_half);
        *writer = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        info!(port = %self.port_name, baud_rate = self.baud_rate, "PC-Link port open");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let port = writer.as_mut().ok_or(Error::NotConnected)?;

        trace!(port = %self.port_name, data = ?String::from_utf8_lossy(data), "write");
        port.write_all(data).await.map_err(|e| {
            error!(port = %self.port_name, error = %e, "write failed");
            map_io_error(e)
        })?;
        port.flush().await.map_err(map_io_error)
    }

    async fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        let port = reader.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => {
                trace!(port = %self.port_name, data = ?String::from_utf8_lossy(&buf[..n]), "read");
                Ok(n)
            }
            Ok(Err(e)) => {
                error!(port = %self.port_name, error = %e, "read failed");
                Err(map_io_error(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut port) = writer.take() {
            if let Err(e) = port.flush().await {
                warn!(port = %self.port_name, error = %e, "flush before close failed");
            }
        }
        if reader.take().is_some() {
            info!(port = %self.port_name, "PC-Link port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}
