//! nikobus-core: core traits, types and error definitions for the Nikobus
//! protocol engine.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level duplex stream to the PC-Link
//! - [`Command`] -- an outgoing frame with its retry and ack policy
//! - [`Frame`] -- a received frame
//! - [`BusEvent`] -- asynchronous bus notifications
//! - [`EventSink`] -- outbound item updates
//! - [`Error`] / [`Result`] -- error handling

pub mod command;
pub mod error;
pub mod events;
pub mod frame;
pub mod sink;
pub mod transport;
pub mod types;

pub use command::{Command, CommandKind, RedundancyKey};
pub use error::{Error, Result};
pub use events::BusEvent;
pub use frame::{Frame, FrameKind};
pub use sink::{EventSink, NullSink};
pub use transport::Transport;
pub use types::*;
