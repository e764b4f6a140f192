//! PC-Link wire format: framing, checksums and the handful of commands the
//! engine builds itself.
//!
//! Every frame on the bus is printable ASCII terminated by a carriage return.
//! Responses start with `$`, unsolicited events with `#`. Commands that carry
//! a payload are protected by two checksums: a CRC-16/CCITT over the
//! hex-decoded payload, followed by a CRC-8 over the ASCII text so far.

use bytes::{Buf, BytesMut};
use tracing::warn;

use nikobus_core::error::{Error, Result};
use nikobus_core::frame::Frame;
use nikobus_core::{Address, ChannelGroup, Command, CommandKind};

/// The carriage return that terminates every frame.
pub const TERMINATOR: u8 = b'\r';

/// Maximum number of unterminated bytes kept before the buffer is reset.
pub const MAX_BUF: usize = 4096;

/// Header of a module status reply. The module address follows in bus order.
pub const STATUS_RESPONSE_HEADER: &str = "$1C";

/// Header of a read command addressed to a module.
pub const READ_COMMAND_HEADER: &str = "$10";

/// Commands sent to the PC-Link after the port opens, in order.
pub const HANDSHAKE: [&str; 8] = [
    "++++",
    "ATH0",
    "ATZ",
    "$10110000B8CF9D",
    "#L0",
    "#E0",
    "#L0",
    "#E1",
];

/// Offset of the first output level in a status reply.
const LEVELS_OFFSET: usize = 9;

/// Length of a status reply without its trailing checksums.
const STATUS_BODY_LEN: usize = LEVELS_OFFSET + 2 * ChannelGroup::SIZE;

/// Length of the CRC-16 and CRC-8 suffix in hex characters.
const CHECKSUM_LEN: usize = 6;

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// CRC-16/CCITT-FALSE: polynomial 0x1021, initial value 0xFFFF, no reflection.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// CRC-8 with polynomial 0x99 and initial value 0, no reflection.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x99
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(Error::Protocol(format!("odd number of hex digits in {text:?}")));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::Protocol(format!("invalid hex digits in {text:?}")))
        })
        .collect()
}

/// Append both checksums to a command body such as `$10120E6C`.
///
/// The first three characters (`$` plus the two-digit command code) are
/// excluded from the CRC-16; everything after them must be hex.
pub fn append_checksum(body: &str) -> Result<String> {
    let data = body
        .get(3..)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| Error::InvalidParameter(format!("command body too short: {body:?}")))?;
    let bytes = decode_hex(data).map_err(|_| {
        Error::InvalidParameter(format!("command body is not hex after header: {body:?}"))
    })?;
    let mut text = format!("{body}{:04X}", crc16(&bytes));
    let check = crc8(text.as_bytes());
    text.push_str(&format!("{check:02X}"));
    Ok(text)
}

/// Check the two trailing checksums of a frame produced by [`append_checksum`].
pub fn verify_checksum(text: &str) -> bool {
    if text.len() <= 3 + CHECKSUM_LEN || !text.is_ascii() {
        return false;
    }
    let body = &text[..text.len() - CHECKSUM_LEN];
    match append_checksum(body) {
        Ok(expected) => expected.eq_ignore_ascii_case(text),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Serialize a command for the wire: the payload followed by the terminator.
pub fn encode(command: &Command) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(command.payload().len() + 1);
    bytes.extend_from_slice(command.payload().as_bytes());
    bytes.push(TERMINATOR);
    bytes
}

/// Acknowledgement prefix of a status reply from `address`.
pub fn status_ack_pattern(address: &Address) -> String {
    format!("{STATUS_RESPONSE_HEADER}{}", address.bus_order())
}

/// Build the status request for one channel group of a module.
///
/// The command expects the module's `$1C` reply as acknowledgement.
pub fn status_request(address: &Address, group: ChannelGroup) -> Result<Command> {
    if address.as_str().len() != 4 {
        return Err(Error::InvalidParameter(format!(
            "module address must have 4 hex digits, got {address}"
        )));
    }
    let code = match group {
        ChannelGroup::One => "12",
        ChannelGroup::Two => "17",
    };
    let payload = append_checksum(&format!(
        "{READ_COMMAND_HEADER}{code}{}",
        address.bus_order()
    ))?;
    Ok(
        Command::new(address.clone(), CommandKind::StatusRequest(group), payload)
            .with_ack(status_ack_pattern(address)),
    )
}

/// Build a button press for a 6-digit button address.
pub fn button_press(address: &Address) -> Result<Command> {
    if address.as_str().len() != 6 {
        return Err(Error::InvalidParameter(format!(
            "button address must have 6 hex digits, got {address}"
        )));
    }
    Ok(Command::new(
        address.clone(),
        CommandKind::ButtonPress,
        format!("{}{address}", nikobus_core::frame::BUTTON_PRESS_HEADER),
    ))
}

/// The PC-Link initialisation sequence as raw commands.
pub fn handshake() -> Vec<Command> {
    let controller = Address::controller();
    HANDSHAKE
        .iter()
        .map(|payload| Command::new(controller.clone(), CommandKind::Raw, *payload))
        .collect()
}

/// Extract the six output levels from a status reply.
///
/// The reply checksums are verified when present.
pub fn parse_status_levels(frame: &Frame) -> Result<[u8; ChannelGroup::SIZE]> {
    let text = frame.as_str();
    if !text.starts_with(STATUS_RESPONSE_HEADER) {
        return Err(Error::Protocol(format!("not a status reply: {text}")));
    }
    let levels_text = text
        .get(LEVELS_OFFSET..STATUS_BODY_LEN)
        .ok_or_else(|| Error::Protocol(format!("status reply too short: {text}")))?;
    if text.len() >= STATUS_BODY_LEN + CHECKSUM_LEN
        && !verify_checksum(&text[..STATUS_BODY_LEN + CHECKSUM_LEN])
    {
        return Err(Error::Protocol(format!("status reply checksum mismatch: {text}")));
    }

    let bytes = decode_hex(levels_text)?;
    let mut levels = [0u8; ChannelGroup::SIZE];
    levels.copy_from_slice(&bytes);
    Ok(levels)
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Result of attempting to decode one frame from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete frame, and the number of bytes it used (terminator included).
    Frame(Frame, usize),

    /// A terminated line that carried no content, such as the `\n` of a CRLF.
    Empty(usize),

    /// A terminated line that is not a valid frame.
    Malformed { consumed: usize, reason: String },

    /// No terminator yet.
    Incomplete,
}

fn is_filler(byte: u8) -> bool {
    matches!(byte, b'\n' | b' ' | b'\t' | 0)
}

/// Decode the first carriage-return-terminated frame in `buf`.
pub fn decode_frame(buf: &[u8]) -> DecodeResult {
    let Some(term_pos) = buf.iter().position(|&b| b == TERMINATOR) else {
        return DecodeResult::Incomplete;
    };
    let consumed = term_pos + 1;
    let line = &buf[..term_pos];
    let start = line.iter().position(|&b| !is_filler(b)).unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|&b| !is_filler(b))
        .map_or(start, |pos| pos + 1);
    let body = &line[start..end];

    if body.is_empty() {
        return DecodeResult::Empty(consumed);
    }
    match Frame::parse(body) {
        Ok(frame) => DecodeResult::Frame(frame, consumed),
        Err(e) => DecodeResult::Malformed {
            consumed,
            reason: e.to_string(),
        },
    }
}

/// Accumulates raw reads and splits them into frames.
///
/// Bytes that arrive without a terminator stay buffered across calls, so a
/// frame split over any number of reads comes out whole.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every frame completed by it, in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match decode_frame(&self.buf) {
                DecodeResult::Frame(frame, consumed) => {
                    self.buf.advance(consumed);
                    frames.push(frame);
                }
                DecodeResult::Empty(consumed) => self.buf.advance(consumed),
                DecodeResult::Malformed { consumed, reason } => {
                    warn!(
                        line = ?String::from_utf8_lossy(&self.buf[..consumed - 1]),
                        %reason,
                        "discarding malformed frame"
                    );
                    self.buf.advance(consumed);
                }
                DecodeResult::Incomplete => break,
            }
        }

        if self.buf.len() > MAX_BUF {
            warn!(len = self.buf.len(), "receive buffer overflow, resetting");
            self.buf.clear();
        }
        frames
    }

    /// Number of buffered bytes still waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
