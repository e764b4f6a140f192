//! PC-Link IO for the Nikobus engine.
//!
//! This crate owns everything between the byte-level [`Transport`] and the
//! engine facade:
//!
//! - [`protocol`]: framing, checksums and the commands the engine builds.
//! - [`receiver`]: the task that reads frames and dispatches them.
//! - [`registry`]: acknowledgement waiters and persistent frame listeners.
//! - [`sender`]: the FIFO command queue and its writer task.
//! - [`ack`]: send-and-wait with retries.
//! - [`cache`]: recently written commands, for redundancy checks.
//! - [`activity`]: bus traffic timestamps, for silence waits.
//!
//! [`Transport`]: nikobus_core::Transport

pub mod ack;
pub mod activity;
pub mod cache;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod task;

pub use ack::{AckMonitor, AckState};
pub use activity::BusActivity;
pub use cache::{CacheEntry, CommandCache, DEFAULT_CACHE_TTL};
pub use protocol::{DecodeResult, FrameAssembler};
pub use receiver::{spawn_receiver, ReceiverConfig};
pub use registry::{
    AckRegistration, Dispatch, FrameFilter, FrameListener, ListenerId, ListenerRegistry,
};
pub use sender::{
    spawn_sender, CommandSender, Reservation, SenderConfig, Submission, DEFAULT_QUIET_INTERVAL,
    DEFAULT_SILENCE_MAX_WAIT,
};
pub use task::TaskHandle;
