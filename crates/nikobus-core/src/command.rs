//! Commands queued for transmission on the bus.
//!
//! A [`Command`] is built by value, then handed to the engine which wraps it
//! in an `Arc` and never mutates it again. Its [`RedundancyKey`] is what the
//! sender compares when deciding whether a new request duplicates one that
//! is already queued or was sent recently.

use std::time::Duration;

use crate::types::{Address, ChannelGroup};

/// Default number of re-sends after the first attempt.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// Default time to wait for an acknowledgement after each write.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// What a command does, as far as redundancy checks are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Read the output levels of one channel group.
    StatusRequest(ChannelGroup),
    /// Simulate a push-button press.
    ButtonPress,
    /// Any other payload.
    Raw,
}

/// Identity used to detect duplicate commands: target address plus kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedundancyKey {
    pub address: Address,
    pub kind: CommandKind,
}

/// A command for the bus controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    address: Address,
    kind: CommandKind,
    payload: String,
    ack: Option<String>,
    max_retry_count: u32,
    wait_for_silence: bool,
    ack_timeout: Duration,
}

impl Command {
    /// Create a fire-and-forget command carrying `payload` (without the
    /// frame terminator).
    pub fn new(address: Address, kind: CommandKind, payload: impl Into<String>) -> Self {
        Command {
            address,
            kind,
            payload: payload.into(),
            ack: None,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            wait_for_silence: false,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Require an acknowledgement: a received frame starting with `pattern`.
    pub fn with_ack(mut self, pattern: impl Into<String>) -> Self {
        self.ack = Some(pattern.into());
        self
    }

    /// Set how many times the command is re-sent when no ack arrives.
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Hold the command until the bus has been quiet for a while.
    pub fn with_wait_for_silence(mut self, wait: bool) -> Self {
        self.wait_for_silence = wait;
        self
    }

    /// Set the per-attempt acknowledgement timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// The ASCII frame body, without terminator.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Expected acknowledgement prefix, if the command needs one.
    pub fn ack(&self) -> Option<&str> {
        self.ack.as_deref()
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    pub fn wait_for_silence(&self) -> bool {
        self.wait_for_silence
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn redundancy_key(&self) -> RedundancyKey {
        RedundancyKey {
            address: self.address.clone(),
            kind: self.kind,
        }
    }
}
