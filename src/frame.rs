//! Size-first, XOR-checksummed framing.
//!
//! ```text
//! [size_1] ([size_2]) [command] [payload...] [checksum]
//! ```
//!
//! - `size_1 == 0x00` is a resynchronization sentinel, not a frame. A zero
//!   only resynchronizes where a size byte is expected; inside a frame it is
//!   data, and flushing a partial frame takes a run of zeros longer than the
//!   largest frame (see [`reset_sequence`]).
//! - If the high bit of `size_1` is set the length is
//!   `((size_1 & 0x7F) << 8) | size_2`, otherwise it is `size_1` itself.
//! - The length counts the command byte plus the payload.
//! - The checksum is the XOR of every byte before it, so folding it into the
//!   running XOR of the received frame leaves zero when nothing was corrupted.

use crate::protocol::MAX_FRAME_LENGTH;

/// Largest length that fits the one-byte size form.
const SHORT_FORM_MAX: usize = 0x7F;
const LONG_FORM_BIT: u8 = 0x80;

/// One checksum-verified unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.command, &self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame for command {command:#04x} fails checksum check (residue {residue:#04x})")]
    Checksum { command: u8, residue: u8 },

    #[error("Frame declares invalid length {length} (accepted 1..={max})")]
    InvalidLength { length: usize, max: usize },

    #[error("Payload of {length} bytes does not fit in a frame")]
    PayloadTooLarge { length: usize },
}

/// Decoder sub-state, named after the byte it expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    #[default]
    Size,
    SizeHigh,
    Command,
    Payload,
    Checksum,
}

/// Byte-at-a-time frame decoder.
///
/// All state lives in this value, so a decoder can be driven from a live
/// channel or from a test vector alike.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: DecoderState,
    checksum: u8,
    remaining: usize,
    command: u8,
    payload: Vec<u8>,
    max_length: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    /// Create a decoder that rejects frames whose declared length exceeds
    /// `max_length`.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            state: DecoderState::Size,
            checksum: 0,
            remaining: 0,
            command: 0,
            payload: Vec::new(),
            max_length: max_length.clamp(1, MAX_FRAME_LENGTH),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Drop any partial frame and wait for the next size byte.
    pub fn reset(&mut self) {
        self.state = DecoderState::Size;
        self.checksum = 0;
        self.remaining = 0;
        self.command = 0;
        self.payload.clear();
    }

    /// Consume one byte.
    ///
    /// Returns `Ok(Some(frame))` when the byte completes a valid frame,
    /// `Ok(None)` while a frame is still being assembled, and an error when a
    /// frame had to be discarded. The decoder is back in [`DecoderState::Size`]
    /// after any frame completes, valid or not.
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>, FrameError> {
        match self.state {
            DecoderState::Size => {
                if byte == 0 {
                    self.reset();
                    return Ok(None);
                }
                self.checksum = byte;
                if byte & LONG_FORM_BIT != 0 {
                    self.remaining = usize::from(byte & !LONG_FORM_BIT) << 8;
                    self.state = DecoderState::SizeHigh;
                } else {
                    self.remaining = usize::from(byte);
                    self.begin_frame()?;
                }
            }
            DecoderState::SizeHigh => {
                self.checksum ^= byte;
                self.remaining |= usize::from(byte);
                self.begin_frame()?;
            }
            DecoderState::Command => {
                self.checksum ^= byte;
                self.command = byte;
                self.remaining -= 1;
                self.state = if self.remaining > 0 {
                    DecoderState::Payload
                } else {
                    DecoderState::Checksum
                };
            }
            DecoderState::Payload => {
                self.checksum ^= byte;
                self.payload.push(byte);
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = DecoderState::Checksum;
                }
            }
            DecoderState::Checksum => {
                let residue = self.checksum ^ byte;
                let command = self.command;
                let payload = std::mem::take(&mut self.payload);
                self.reset();
                if residue != 0 {
                    return Err(FrameError::Checksum { command, residue });
                }
                return Ok(Some(Frame { command, payload }));
            }
        }
        Ok(None)
    }

    fn begin_frame(&mut self) -> Result<(), FrameError> {
        let length = self.remaining;
        if length == 0 || length > self.max_length {
            self.reset();
            return Err(FrameError::InvalidLength {
                length,
                max: self.max_length,
            });
        }
        self.payload = Vec::with_capacity(length - 1);
        self.state = DecoderState::Command;
        Ok(())
    }
}

/// Encode a command and payload into wire bytes, checksum included.
pub fn encode_frame(command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = payload.len() + 1;
    if length > MAX_FRAME_LENGTH {
        return Err(FrameError::PayloadTooLarge {
            length: payload.len(),
        });
    }

    let mut out = Vec::with_capacity(length + 3);
    if length > SHORT_FORM_MAX {
        out.push(LONG_FORM_BIT | (length >> 8) as u8);
        out.push((length & 0xFF) as u8);
    } else {
        out.push(length as u8);
    }
    out.push(command);
    out.extend_from_slice(payload);

    let checksum = out.iter().fold(0u8, |acc, b| acc ^ b);
    out.push(checksum);
    Ok(out)
}

/// A run of resynchronization sentinels.
///
/// A receiver stuck inside a frame swallows the leading zeros as payload,
/// fails the checksum, and reads the remaining zeros as sentinels. `length`
/// must exceed the longest frame the receiver accepts for that to hold.
pub fn reset_sequence(length: usize) -> Vec<u8> {
    vec![0u8; length]
}
