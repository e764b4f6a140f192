//! Core types used throughout the Nikobus engine.
//!
//! Addresses, channel groups and module kinds are plain value types shared
//! by the codec, the engine and the configuration layer that sits above it.

use std::fmt;
use std::str::FromStr;

/// A bus address in upper-case hexadecimal.
///
/// Output modules use 4 hex digits (`6C0E`), push buttons use 6 (`0D1C2A`).
/// Module addresses travel over the bus with their two bytes swapped; see
/// [`Address::bus_order`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Address `0000`, used for commands aimed at the PC-Link itself.
    pub fn controller() -> Self {
        Address("0000".to_string())
    }

    /// The address as written in configuration (`6C0E`).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address in on-the-wire byte order.
    ///
    /// Byte pairs are reversed, so `6C0E` becomes `0E6C`.
    pub fn bus_order(&self) -> String {
        self.0
            .as_bytes()
            .rchunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
            .collect()
    }

    /// Rebuild a configuration-order address from its on-the-wire form.
    pub fn from_bus_order(wire: &str) -> Result<Self, ParseAddressError> {
        let parsed: Address = wire.parse()?;
        Ok(Address(parsed.bus_order()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a string cannot be parsed into an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddressError(String);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bus address: {:?}", self.0)
    }
}

impl std::error::Error for ParseAddressError {}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let valid = !s.is_empty()
            && s.len() % 2 == 0
            && s.len() <= 8
            && s.bytes().all(|b| b.is_ascii_hexdigit());
        if valid {
            Ok(Address(s.to_ascii_uppercase()))
        } else {
            Err(ParseAddressError(s.to_string()))
        }
    }
}

/// One of the two banks of six outputs on a Nikobus output module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelGroup {
    /// Outputs 1 to 6.
    One,
    /// Outputs 7 to 12.
    Two,
}

impl ChannelGroup {
    /// Number of outputs in a group.
    pub const SIZE: usize = 6;

    /// The group that owns a 1-based output number, if it is in range.
    pub fn for_channel(channel: u8) -> Option<Self> {
        match channel {
            1..=6 => Some(ChannelGroup::One),
            7..=12 => Some(ChannelGroup::Two),
            _ => None,
        }
    }

    /// First 1-based output number in this group.
    pub fn first_channel(&self) -> u8 {
        match self {
            ChannelGroup::One => 1,
            ChannelGroup::Two => 7,
        }
    }
}

impl fmt::Display for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelGroup::One => write!(f, "group-1"),
            ChannelGroup::Two => write!(f, "group-2"),
        }
    }
}

/// Kind of output module installed on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// 12-channel relay switch module.
    Switch,
    /// 12-channel dimmer module.
    Dimmer,
    /// 6-channel roller shutter module.
    RollerShutter,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleKind::Switch => "switch",
            ModuleKind::Dimmer => "dimmer",
            ModuleKind::RollerShutter => "rollershutter",
        };
        f.write_str(s)
    }
}

/// Error returned when a string cannot be parsed into a [`ModuleKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModuleKindError(String);

impl fmt::Display for ParseModuleKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown module kind: {}", self.0)
    }
}

impl std::error::Error for ParseModuleKindError {}

impl FromStr for ModuleKind {
    type Err = ParseModuleKindError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "switch" => Ok(ModuleKind::Switch),
            "dimmer" => Ok(ModuleKind::Dimmer),
            "rollershutter" | "roller-shutter" | "shutter" => Ok(ModuleKind::RollerShutter),
            _ => Err(ParseModuleKindError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parses_and_normalises_case() {
        let addr: Address = "6c0e".parse().unwrap();
        assert_eq!(addr.as_str(), "6C0E");
        assert_eq!(addr.to_string(), "6C0E");
    }

    #[test]
    fn address_rejects_odd_length() {
        assert!("6C0".parse::<Address>().is_err());
    }

    #[test]
    fn address_rejects_non_hex() {
        assert!("6CXE".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn address_bus_order_swaps_bytes() {
        let addr: Address = "6C0E".parse().unwrap();
        assert_eq!(addr.bus_order(), "0E6C");

        let button: Address = "0D1C2A".parse().unwrap();
        assert_eq!(button.bus_order(), "2A1C0D");
    }

    #[test]
    fn address_from_bus_order() {
        let addr = Address::from_bus_order("0E6C").unwrap();
        assert_eq!(addr.as_str(), "6C0E");
    }

    #[test]
    fn channel_group_for_channel() {
        assert_eq!(ChannelGroup::for_channel(1), Some(ChannelGroup::One));
        assert_eq!(ChannelGroup::for_channel(6), Some(ChannelGroup::One));
        assert_eq!(ChannelGroup::for_channel(7), Some(ChannelGroup::Two));
        assert_eq!(ChannelGroup::for_channel(12), Some(ChannelGroup::Two));
        assert_eq!(ChannelGroup::for_channel(0), None);
        assert_eq!(ChannelGroup::for_channel(13), None);
    }

    #[test]
    fn channel_group_first_channel() {
        assert_eq!(ChannelGroup::One.first_channel(), 1);
        assert_eq!(ChannelGroup::Two.first_channel(), 7);
    }

    #[test]
    fn module_kind_round_trip_display() {
        for kind in [ModuleKind::Switch, ModuleKind::Dimmer, ModuleKind::RollerShutter] {
            let parsed: ModuleKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn module_kind_unknown() {
        let err = "thermostat".parse::<ModuleKind>().unwrap_err();
        assert_eq!(err.to_string(), "unknown module kind: thermostat");
    }
}
