//! Outbound state updates.

/// Receiver of sensed values, implemented by the item layer that sits on
/// top of the engine.
pub trait EventSink: Send + Sync {
    /// Report that `item` now has output level `value` (`0x00` off,
    /// `0xFF` fully on).
    fn post_update(&self, item: &str, value: u8);
}

/// Sink that drops every update.
pub struct NullSink;

impl EventSink for NullSink {
    fn post_update(&self, _item: &str, _value: u8) {}
}
