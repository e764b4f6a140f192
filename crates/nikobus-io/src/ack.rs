//! Send-and-wait with retries.
//!
//! An [`AckMonitor`] registers for the command's acknowledgement pattern
//! before the first write, then submits the command up to
//! `max_retry_count + 1` times. Each attempt waits `ack_timeout` measured from
//! the moment the bytes were written.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use nikobus_core::error::{Error, Result};
use nikobus_core::{Command, Frame};

use crate::registry::ListenerRegistry;
use crate::sender::CommandSender;

/// Progress of one acknowledged exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Created,
    Sent,
    AwaitingAck,
    RetrySent,
    Acked,
    TimedOut,
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckState::Created => "created",
            AckState::Sent => "sent",
            AckState::AwaitingAck => "awaiting-ack",
            AckState::RetrySent => "retry-sent",
            AckState::Acked => "acked",
            AckState::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct AckMonitor {
    command: Arc<Command>,
    state: AckState,
    attempts: u32,
}

impl AckMonitor {
    /// Fails with [`Error::InvalidParameter`] if the command has no
    /// acknowledgement pattern.
    pub fn new(command: Arc<Command>) -> Result<Self> {
        if command.ack().is_none() {
            return Err(Error::InvalidParameter(format!(
                "command {} expects no acknowledgement",
                command.payload()
            )));
        }
        Ok(AckMonitor {
            command,
            state: AckState::Created,
            attempts: 0,
        })
    }

    pub fn state(&self) -> AckState {
        self.state
    }

    /// Number of times the command has been submitted.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Send the command and wait for its acknowledgement frame.
    ///
    /// Write failures and sender shutdown end the exchange immediately.
    /// The waiter is unregistered on every exit path.
    pub async fn wait_for_ack(
        &mut self,
        registry: &Arc<ListenerRegistry>,
        sender: &CommandSender,
    ) -> Result<Frame> {
        let pattern = self.command.ack().unwrap_or_default();
        let mut registration = registry.register_ack(pattern).await;
        let retries = self.command.max_retry_count();

        for attempt in 0..=retries {
            self.state = if attempt == 0 {
                AckState::Sent
            } else {
                debug!(
                    payload = self.command.payload(),
                    attempt, "no acknowledgement, resending"
                );
                AckState::RetrySent
            };
            self.attempts += 1;
            sender.submit(Arc::clone(&self.command)).written().await?;

            self.state = AckState::AwaitingAck;
            match tokio::time::timeout(self.command.ack_timeout(), registration.frame()).await {
                Ok(Ok(frame)) => {
                    self.state = AckState::Acked;
                    debug!(
                        payload = self.command.payload(),
                        attempts = self.attempts,
                        %frame,
                        "acknowledged"
                    );
                    return Ok(frame);
                }
                Ok(Err(_)) => return Err(Error::Stopped),
                Err(_) => {}
            }
        }

        self.state = AckState::TimedOut;
        warn!(
            payload = self.command.payload(),
            attempts = self.attempts,
            "no acknowledgement after all attempts"
        );
        Err(Error::AckTimeout {
            command: self.command.payload().to_string(),
            attempts: self.attempts,
        })
    }
}
