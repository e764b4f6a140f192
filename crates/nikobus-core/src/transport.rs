//! Transport trait for PC-Link communication.
//!
//! The [`Transport`] trait abstracts over the byte stream to the bus
//! controller. The engine reads and writes from two different tasks, so
//! every method takes `&self`; implementations keep their read and write
//! paths behind separate locks.
//!
//! No framing knowledge lives here. Frame assembly and command encoding
//! are handled by `nikobus-io`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to the bus controller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying stream.
    ///
    /// Returns [`Error::Transport`](crate::error::Error::Transport) when the
    /// port cannot be opened. Opening an already open transport is a no-op.
    async fn open(&self) -> Result<()>;

    /// Write raw bytes and flush them.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive bytes into the provided buffer.
    ///
    /// Waits up to `timeout`; returns
    /// [`Error::Timeout`](crate::error::Error::Timeout) if nothing arrived and
    /// [`Error::NotConnected`](crate::error::Error::NotConnected) when closed.
    async fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the stream. Closing a closed transport is a no-op.
    async fn close(&self) -> Result<()>;

    /// Whether the stream is currently open.
    fn is_connected(&self) -> bool;

    /// Identifier of the port this transport talks to.
    fn port_name(&self) -> &str;
}
