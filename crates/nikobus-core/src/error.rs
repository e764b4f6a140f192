//! Error types for the Nikobus engine.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer and
//! acknowledgement failures are all captured here.

/// The error type for all Nikobus operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port unavailable, open failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed frame, bad checksum).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded read elapsed without any bytes arriving.
    #[error("timeout waiting for data")]
    Timeout,

    /// No acknowledgement arrived for a command within its retry budget.
    #[error("no acknowledgement for {command} after {attempts} attempts")]
    AckTimeout {
        /// Payload of the command that went unacknowledged.
        command: String,
        /// Number of times the command was written.
        attempts: u32,
    },

    /// An invalid parameter was passed to an engine operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No module is configured at the requested address.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// The transport is not open.
    #[error("not connected")]
    NotConnected,

    /// The connection to the PC-Link was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// The engine was stopped before the operation completed.
    #[error("engine stopped")]
    Stopped,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_protocol() {
        let e = Error::Protocol("bad checksum".into());
        assert_eq!(e.to_string(), "protocol error: bad checksum");
    }

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for data");
    }

    #[test]
    fn error_display_ack_timeout() {
        let e = Error::AckTimeout {
            command: "$10120E6C6FBA24".into(),
            attempts: 4,
        };
        assert_eq!(
            e.to_string(),
            "no acknowledgement for $10120E6C6FBA24 after 4 attempts"
        );
    }

    #[test]
    fn error_display_unknown_module() {
        let e = Error::UnknownModule("6C0E".into());
        assert_eq!(e.to_string(), "unknown module: 6C0E");
    }

    #[test]
    fn error_display_not_connected() {
        assert_eq!(Error::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn error_display_stopped() {
        assert_eq!(Error::Stopped.to_string(), "engine stopped");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
