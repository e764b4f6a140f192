//! # nikobus -- Nikobus bus engine over a PC-Link
//!
//! `nikobus` talks to a Nikobus home-automation installation through the
//! PC-Link serial interface. It transmits commands, matches the
//! acknowledgement frames that come back, retries when they don't, and
//! keeps module state fresh with a slow round-robin status sweep.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use nikobus::{Address, EngineBuilder, Module, ModuleKind, ModuleRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let modules = Arc::new(ModuleRegistry::new());
//!     let address: Address = "6C0E".parse()?;
//!     modules.add(Module::new(address.clone(), ModuleKind::Dimmer).with_channel(1, "kitchen")?);
//!
//!     let engine = EngineBuilder::new()
//!         .serial_port("/dev/ttyUSB0")
//!         .modules(modules)
//!         .build()?;
//!     engine.start().await;
//!     engine.connect().await?;
//!     engine.schedule_status_update_request(&address, false)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                  | Purpose                                              |
//! |------------------------|------------------------------------------------------|
//! | `nikobus-core`         | Errors, [`Transport`] trait, addresses, commands, frames |
//! | `nikobus-transport`    | Serial transport for the PC-Link                     |
//! | `nikobus-io`           | Framing, receiver and sender tasks, ack tracking     |
//! | **`nikobus`**          | This facade: [`Engine`], modules, status refresh     |
//!
//! ## Events
//!
//! The engine publishes [`BusEvent`]s on a broadcast channel: connection
//! changes, button presses seen on the bus and decoded module status.
//!
//! ```no_run
//! use nikobus::{BusEvent, Engine};
//! # async fn example(engine: &Engine) {
//! let mut events = engine.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let BusEvent::ButtonPressed { address } = event {
//!         println!("button {address}");
//!     }
//! }
//! # }
//! ```

pub mod builder;
pub mod engine;
pub mod module;
pub mod scheduler;
pub mod status;

pub use nikobus_core::*;

pub use builder::EngineBuilder;
pub use engine::{Engine, ProtocolEngine, EVENT_CHANNEL_CAPACITY};
pub use module::{Module, ModuleDirectory, ModuleRegistry, MAX_CHANNEL};
pub use nikobus_io::{
    protocol, AckMonitor, AckState, FrameFilter, FrameListener, ListenerId,
};
pub use scheduler::RefreshScheduler;
pub use status::{StatusListener, StatusRefresh, StatusRequests};

/// Serial transport for the PC-Link.
pub mod transport {
    pub use nikobus_transport::*;
}
