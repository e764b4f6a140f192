//! Frames received from the PC-Link.
//!
//! Every frame is a line of printable ASCII. Frames starting with `$` are
//! controller or module responses, frames starting with `#` are bus events
//! such as push-button presses.

use std::fmt;

use crate::error::{Error, Result};
use crate::types::Address;

/// Header of a push-button press event (`#N` + 6 hex digits).
pub const BUTTON_PRESS_HEADER: &str = "#N";

/// Header of a PC-Link acknowledgement (`$05` + echoed command code).
pub const CONTROLLER_ACK_HEADER: &str = "$05";

/// Broad classification of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A push button was pressed on the bus.
    ButtonPress,
    /// The PC-Link acknowledged a command it received.
    ControllerAck,
    /// A module answered a request.
    Response,
    /// Anything else (`#E1`, `#L0`, ...).
    Other,
}

/// One complete frame, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    text: String,
}

impl Frame {
    /// Validate and wrap the body of a frame.
    ///
    /// The body must be non-empty printable ASCII starting with `$` or `#`.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let first = *body
            .first()
            .ok_or_else(|| Error::Protocol("empty frame".into()))?;
        if first != b'$' && first != b'#' {
            return Err(Error::Protocol(format!(
                "frame starts with unexpected byte 0x{first:02X}"
            )));
        }
        if let Some(bad) = body.iter().find(|b| !b.is_ascii_graphic()) {
            return Err(Error::Protocol(format!(
                "frame contains non-printable byte 0x{bad:02X}"
            )));
        }
        // All bytes are ASCII at this point.
        let text = String::from_utf8_lossy(body).into_owned();
        Ok(Frame { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> FrameKind {
        if self.is_button_press() {
            FrameKind::ButtonPress
        } else if self.text.starts_with(CONTROLLER_ACK_HEADER) {
            FrameKind::ControllerAck
        } else if self.text.starts_with('$') {
            FrameKind::Response
        } else {
            FrameKind::Other
        }
    }

    /// Whether this frame satisfies an acknowledgement `pattern`.
    pub fn matches(&self, pattern: &str) -> bool {
        self.text.starts_with(pattern)
    }

    /// Address of the button or module this frame concerns, when it has one.
    ///
    /// Button presses carry the button address after `#N`; module responses
    /// carry the module address in bus order at characters 3..7.
    pub fn address(&self) -> Option<Address> {
        match self.kind() {
            FrameKind::ButtonPress => self.text.get(2..8)?.parse().ok(),
            FrameKind::Response => Address::from_bus_order(self.text.get(3..7)?).ok(),
            FrameKind::ControllerAck | FrameKind::Other => None,
        }
    }

    fn is_button_press(&self) -> bool {
        self.text.len() == BUTTON_PRESS_HEADER.len() + 6
            && self.text.starts_with(BUTTON_PRESS_HEADER)
            && self.text[2..].bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
