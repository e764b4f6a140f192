//! Mock transport for deterministic testing of the protocol engine.
//!
//! # Example
//!
//! ```
//! use nikobus_test_harness::MockTransport;
//!
//! let mock = MockTransport::new();
//! // Whenever a status request for module 6C0E is written, answer with its status.
//! mock.reply_to(b"$10120E6C", b"$1C0E6C00FF00000000FFBD45B5\r");
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;

use nikobus_core::error::{Error, Result};
use nikobus_core::transport::Transport;

/// A reply produced whenever a write starts with `request_prefix`.
#[derive(Debug, Clone)]
struct ReplyRule {
    request_prefix: Vec<u8>,
    response: Vec<u8>,
    /// `None` replies forever, `Some(n)` replies `n` more times.
    remaining: Option<usize>,
}

#[derive(Debug)]
struct MockState {
    rules: Vec<ReplyRule>,
    /// Pending inbound chunks; each `receive()` returns at most one chunk.
    inbound: VecDeque<Vec<u8>>,
    sent_log: Vec<Vec<u8>>,
    fragmenter: Option<(StdRng, usize)>,
    fail_open: bool,
}

/// A mock [`Transport`] for testing without hardware.
///
/// Unlike a serial port, writes never fail while connected. Replies and
/// injected bytes are queued as separate chunks, so tests control exactly
/// where reads are split.
#[derive(Debug)]
pub struct MockTransport {
    port_name: String,
    state: Mutex<MockState>,
    data_ready: Notify,
    connected: AtomicBool,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            port_name: "mock".to_string(),
            state: Mutex::new(MockState {
                rules: Vec::new(),
                inbound: VecDeque::new(),
                sent_log: Vec::new(),
                fragmenter: None,
                fail_open: false,
            }),
            data_ready: Notify::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Answer every write starting with `request_prefix` with `response`.
    pub fn reply_to(&self, request_prefix: &[u8], response: &[u8]) {
        self.add_rule(request_prefix, response, None);
    }

    /// Answer only the next write starting with `request_prefix`.
    pub fn reply_once(&self, request_prefix: &[u8], response: &[u8]) {
        self.add_rule(request_prefix, response, Some(1));
    }

    fn add_rule(&self, request_prefix: &[u8], response: &[u8], remaining: Option<usize>) {
        self.lock().rules.push(ReplyRule {
            request_prefix: request_prefix.to_vec(),
            response: response.to_vec(),
            remaining,
        });
    }

    /// Queue unsolicited bytes as a single chunk.
    pub fn inject(&self, data: &[u8]) {
        self.lock().inbound.push_back(data.to_vec());
        self.data_ready.notify_waiters();
    }

    /// Queue unsolicited bytes split into the given chunks, one read each.
    pub fn inject_chunks(&self, chunks: &[&[u8]]) {
        {
            let mut state = self.lock();
            for chunk in chunks {
                state.inbound.push_back(chunk.to_vec());
            }
        }
        self.data_ready.notify_waiters();
    }

    /// Split every read into random pieces of 1..=`max_fragment` bytes,
    /// driven by a seeded RNG so failures are reproducible.
    pub fn fragment_reads(&self, seed: u64, max_fragment: usize) {
        self.lock().fragmenter = Some((StdRng::seed_from_u64(seed), max_fragment.max(1)));
    }

    /// Make subsequent `open()` calls fail with [`Error::Transport`].
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// All writes, one element per `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.lock().sent_log.clone()
    }

    /// All writes as text with the `\r` terminator removed.
    pub fn sent_frames(&self) -> Vec<String> {
        self.lock()
            .sent_log
            .iter()
            .map(|w| String::from_utf8_lossy(w).trim_end_matches('\r').to_string())
            .collect()
    }

    /// Number of writes so far.
    pub fn sent_count(&self) -> usize {
        self.lock().sent_log.len()
    }

    /// Number of writes starting with `prefix`.
    pub fn sent_count_with_prefix(&self, prefix: &[u8]) -> usize {
        self.lock()
            .sent_log
            .iter()
            .filter(|w| w.starts_with(prefix))
            .count()
    }

    /// Set the connected state directly.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.data_ready.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the log from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_chunk(&self, max: usize) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let mut chunk = state.inbound.pop_front()?;
        let mut limit = max.min(chunk.len());
        if let Some((rng, max_fragment)) = state.fragmenter.as_mut() {
            let piece = rng.gen_range(1..=*max_fragment);
            limit = limit.min(piece);
        }
        if limit < chunk.len() {
            let rest = chunk.split_off(limit);
            state.inbound.push_front(rest);
        }
        Some(chunk)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<()> {
        if self.lock().fail_open {
            return Err(Error::Transport(format!(
                "Failed to open serial port {}: simulated failure",
                self.port_name
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let replied = {
            let mut state = self.lock();
            state.sent_log.push(data.to_vec());

            let mut reply = None;
            for rule in state.rules.iter_mut() {
                if rule.remaining == Some(0) || !data.starts_with(&rule.request_prefix) {
                    continue;
                }
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                reply = Some(rule.response.clone());
                break;
            }
            match reply {
                Some(response) => {
                    state.inbound.push_back(response);
                    true
                }
                None => false,
            }
        };

        tracing::trace!(data = ?String::from_utf8_lossy(data), replied, "mock send");
        if replied {
            self.data_ready.notify_waiters();
        }
        Ok(())
    }

    async fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.data_ready.notified();
            if !self.is_connected() {
                return Err(Error::NotConnected);
            }
            if let Some(chunk) = self.take_chunk(buf.len()) {
                buf[..chunk.len()].copy_from_slice(&chunk);
                return Ok(chunk.len());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.data_ready.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}
