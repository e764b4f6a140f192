//! Frame listener registry.
//!
//! Two kinds of interest are tracked. Acknowledgement waiters are one-shot:
//! the first frame that starts with the waiter's pattern is handed to it and
//! the waiter is removed. Persistent listeners receive every frame their
//! [`FrameFilter`] accepts until they are unregistered.
//!
//! At most one acknowledgement waiter exists per pattern. A second
//! registration for the same pattern waits until the first is released, so
//! two commands expecting the same reply never compete for it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

use nikobus_core::{Address, Frame};

/// Receiver of unsolicited frames.
///
/// `on_frame` runs on the receiver task and must not block.
pub trait FrameListener: Send + Sync {
    /// Name used to unregister every listener of one owner at once.
    fn name(&self) -> &str;

    fn on_frame(&self, frame: &Frame);
}

/// Which frames a persistent listener wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFilter {
    /// Every frame.
    All,
    /// Frames whose decoded address equals this one.
    Address(Address),
    /// Frames whose text starts with this prefix.
    Prefix(String),
}

impl FrameFilter {
    pub fn matches(&self, frame: &Frame) -> bool {
        match self {
            FrameFilter::All => true,
            FrameFilter::Address(address) => frame.address().as_ref() == Some(address),
            FrameFilter::Prefix(prefix) => frame.matches(prefix),
        }
    }
}

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Outcome of dispatching one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// Whether an acknowledgement waiter consumed the frame.
    pub acked: bool,
    /// Number of persistent listeners the frame was delivered to.
    pub delivered: usize,
}

struct AckWaiter {
    id: u64,
    pattern: String,
    tx: oneshot::Sender<Frame>,
}

struct ListenerEntry {
    id: ListenerId,
    filter: FrameFilter,
    listener: Arc<dyn FrameListener>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    waiters: Vec<AckWaiter>,
    listeners: Vec<ListenerEntry>,
}

impl Inner {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    inner: Mutex<Inner>,
    released: Notify,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Acknowledgement waiters
    // -----------------------------------------------------------------------

    /// Register interest in the next frame starting with `pattern`.
    ///
    /// Waits while another registration for the same pattern is alive. The
    /// waiter is removed when the returned guard is dropped.
    pub async fn register_ack(self: &Arc<Self>, pattern: &str) -> AckRegistration {
        loop {
            let released = self.released.notified();
            {
                let mut inner = self.lock();
                if !inner.waiters.iter().any(|w| w.pattern == pattern) {
                    let id = inner.allocate_id();
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(AckWaiter {
                        id,
                        pattern: pattern.to_string(),
                        tx,
                    });
                    trace!(pattern, id, "ack waiter registered");
                    return AckRegistration {
                        registry: Arc::clone(self),
                        id,
                        pattern: pattern.to_string(),
                        rx,
                    };
                }
            }
            debug!(pattern, "ack pattern already awaited, queueing behind it");
            released.await;
        }
    }

    fn release_ack(&self, id: u64) {
        let removed = {
            let mut inner = self.lock();
            let before = inner.waiters.len();
            inner.waiters.retain(|w| w.id != id);
            before != inner.waiters.len()
        };
        if removed {
            trace!(id, "ack waiter released");
        }
        self.released.notify_waiters();
    }

    /// Number of acknowledgement waiters currently registered.
    pub fn pending_acks(&self) -> usize {
        self.lock().waiters.len()
    }

    // -----------------------------------------------------------------------
    // Persistent listeners
    // -----------------------------------------------------------------------

    pub fn register(&self, listener: Arc<dyn FrameListener>, filter: FrameFilter) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.allocate_id());
        debug!(%id, name = listener.name(), ?filter, "listener registered");
        inner.listeners.push(ListenerEntry {
            id,
            filter,
            listener,
        });
        id
    }

    /// Remove one listener. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|entry| entry.id != id);
        before != inner.listeners.len()
    }

    /// Remove every listener whose name is `name`. Returns how many went.
    pub fn unregister_named(&self, name: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|entry| entry.listener.name() != name);
        before - inner.listeners.len()
    }

    pub fn unregister_all(&self) {
        self.lock().listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Hand `frame` to the oldest matching acknowledgement waiter, then to
    /// every persistent listener whose filter accepts it.
    ///
    /// Listeners are called on a snapshot taken under the lock, so they may
    /// register or unregister from inside `on_frame`.
    pub fn dispatch(&self, frame: &Frame) -> Dispatch {
        let (waiter, targets) = {
            let mut inner = self.lock();
            let waiter = inner
                .waiters
                .iter()
                .position(|w| frame.matches(&w.pattern))
                .map(|index| inner.waiters.remove(index));
            let targets: Vec<Arc<dyn FrameListener>> = inner
                .listeners
                .iter()
                .filter(|entry| entry.filter.matches(frame))
                .map(|entry| Arc::clone(&entry.listener))
                .collect();
            (waiter, targets)
        };

        let mut outcome = Dispatch::default();
        if let Some(waiter) = waiter {
            trace!(pattern = %waiter.pattern, %frame, "ack matched");
            outcome.acked = waiter.tx.send(frame.clone()).is_ok();
            self.released.notify_waiters();
        }
        for listener in &targets {
            listener.on_frame(frame);
        }
        outcome.delivered = targets.len();
        outcome
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ListenerRegistry")
            .field("pending_acks", &inner.waiters.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// A live acknowledgement waiter. Dropping it unregisters the waiter.
pub struct AckRegistration {
    registry: Arc<ListenerRegistry>,
    id: u64,
    pattern: String,
    rx: oneshot::Receiver<Frame>,
}

impl AckRegistration {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The channel the matching frame is delivered on.
    pub fn frame(&mut self) -> &mut oneshot::Receiver<Frame> {
        &mut self.rx
    }
}

impl Drop for AckRegistration {
    fn drop(&mut self) {
        self.registry.release_ack(self.id);
    }
}

impl fmt::Debug for AckRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckRegistration")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Recorder {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl FrameListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_frame(&self, frame: &Frame) {
            self.seen.lock().unwrap().push(frame.to_string());
        }
    }

    fn frame(text: &str) -> Frame {
        Frame::parse(text.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn ack_waiter_receives_matching_frame_once() {
        let registry = Arc::new(ListenerRegistry::new());
        let mut reg = registry.register_ack("$1C0E6C").await;
        assert_eq!(registry.pending_acks(), 1);

        let outcome = registry.dispatch(&frame("$1C0E6C00FF00000000FFBD45B5"));
        assert!(outcome.acked);
        assert_eq!(registry.pending_acks(), 0);

        let got = reg.frame().await.unwrap();
        assert!(got.matches("$1C0E6C"));

        let again = registry.dispatch(&frame("$1C0E6C00FF00000000FFBD45B5"));
        assert!(!again.acked);
    }

    #[tokio::test]
    async fn non_matching_frame_leaves_waiter() {
        let registry = Arc::new(ListenerRegistry::new());
        let _reg = registry.register_ack("$1C0E6C").await;
        assert!(!registry.dispatch(&frame("$1C221100FFFFFFFFFFFF")).acked);
        assert_eq!(registry.pending_acks(), 1);
    }

    #[tokio::test]
    async fn dropping_registration_unregisters() {
        let registry = Arc::new(ListenerRegistry::new());
        let reg = registry.register_ack("$1C0E6C").await;
        drop(reg);
        assert_eq!(registry.pending_acks(), 0);
    }

    #[tokio::test]
    async fn same_pattern_waits_for_release() {
        let registry = Arc::new(ListenerRegistry::new());
        let first = registry.register_ack("$1C0E6C").await;

        let r = Arc::clone(&registry);
        let second = tokio::spawn(async move {
            let reg = r.register_ack("$1C0E6C").await;
            reg.pattern().to_string()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        assert_eq!(registry.pending_acks(), 1);

        drop(first);
        let pattern = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pattern, "$1C0E6C");
    }

    #[tokio::test]
    async fn different_patterns_coexist() {
        let registry = Arc::new(ListenerRegistry::new());
        let _a = registry.register_ack("$1C0E6C").await;
        let _b = registry.register_ack("$1C2211").await;
        assert_eq!(registry.pending_acks(), 2);
    }

    #[test]
    fn listeners_filtered_by_address_and_prefix() {
        let registry = ListenerRegistry::new();
        let all = Recorder::new("all");
        let button = Recorder::new("button");
        let status = Recorder::new("status");
        registry.register(all.clone(), FrameFilter::All);
        registry.register(
            button.clone(),
            FrameFilter::Address("0D1C2A".parse().unwrap()),
        );
        registry.register(status.clone(), FrameFilter::Prefix("$1C".into()));

        let outcome = registry.dispatch(&frame("#N0D1C2A"));
        assert_eq!(outcome.delivered, 2);
        registry.dispatch(&frame("$1C0E6C00FF00000000FFBD45B5"));

        assert_eq!(all.seen().len(), 2);
        assert_eq!(button.seen(), ["#N0D1C2A"]);
        assert_eq!(status.seen(), ["$1C0E6C00FF00000000FFBD45B5"]);
    }

    #[test]
    fn unregister_variants() {
        let registry = ListenerRegistry::new();
        let a = Recorder::new("items");
        let b = Recorder::new("items");
        let c = Recorder::new("other");
        let id = registry.register(a, FrameFilter::All);
        registry.register(b, FrameFilter::All);
        registry.register(c, FrameFilter::All);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.unregister_named("items"), 1);
        assert_eq!(registry.listener_count(), 1);
        registry.unregister_all();
        assert_eq!(registry.listener_count(), 0);
    }

    struct SelfRemoving {
        registry: Arc<ListenerRegistry>,
    }

    impl FrameListener for SelfRemoving {
        fn name(&self) -> &str {
            "once"
        }

        fn on_frame(&self, _frame: &Frame) {
            self.registry.unregister_named("once");
        }
    }

    #[test]
    fn listener_may_unregister_during_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        registry.register(
            Arc::new(SelfRemoving {
                registry: Arc::clone(&registry),
            }),
            FrameFilter::All,
        );
        assert_eq!(registry.dispatch(&frame("#E1")).delivered, 1);
        assert_eq!(registry.listener_count(), 0);
    }
}
