//! nikobus-test-harness: mock transport for exercising the Nikobus engine
//! without a PC-Link attached.
//!
//! [`MockTransport`] answers written commands from a table of reply rules,
//! accepts injected unsolicited traffic, can fragment its reads at random
//! (seeded) boundaries, and records every write for later assertions.

pub mod mock_serial;

pub use mock_serial::MockTransport;
