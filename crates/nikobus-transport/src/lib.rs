//! Transport implementations for the Nikobus engine.
//!
//! This crate provides [`SerialTransport`], the concrete implementation of
//! the [`Transport`](nikobus_core::Transport) trait for the PC-Link serial
//! interface.

pub mod serial;

pub use serial::{available_ports, SerialTransport, DEFAULT_BAUD_RATE};
