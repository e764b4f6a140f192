//! Asynchronous bus event types.
//!
//! Events are emitted through a `tokio::sync::broadcast` channel owned by
//! the engine. Subscribers that fall behind may miss events.

use crate::types::{Address, ChannelGroup};

/// An event observed on, or about, the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The PC-Link connection was opened.
    Connected,

    /// The PC-Link connection was closed.
    Disconnected,

    /// A push button was pressed.
    ButtonPressed {
        /// Button address (6 hex digits).
        address: Address,
    },

    /// A module reported the levels of one channel group.
    ModuleStatus {
        /// Module address.
        address: Address,
        /// Which bank of outputs the levels belong to.
        group: ChannelGroup,
        /// Output levels, first channel of the group first.
        levels: [u8; ChannelGroup::SIZE],
    },
}
