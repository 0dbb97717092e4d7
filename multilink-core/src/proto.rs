//! Wire format of multilink fragments.
//!
//! Every fragment is a header immediately followed by a slice of the packet being
//! carried. The header is transmitted in network byte order (big-endian) and comes
//! in two widths, chosen once per session:
//!
//! ```text
//! short (16 bits):  [B][E][0 0][sequence: 12 bits]
//! long  (32 bits):  [B][E][0 0 0 0 0 0][sequence: 24 bits]
//! ```
//!
//! `B` marks the first fragment of a packet and `E` the last. The reserved bits
//! must be zero; a header with any of them set is rejected.

use crate::sequence::SeqWidth;

/// Begin flag in a short header
const SHORT_BEGIN: u16 = 0x8000;
/// End flag in a short header
const SHORT_END: u16 = 0x4000;
/// Reserved bits in a short header
const SHORT_RESERVED: u16 = 0x3000;

/// Begin flag in a long header
const LONG_BEGIN: u32 = 0x8000_0000;
/// End flag in a long header
const LONG_END: u32 = 0x4000_0000;
/// Reserved bits in a long header
const LONG_RESERVED: u32 = 0x3F00_0000;

/// Fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// First fragment of a packet
    pub begin: bool,
    /// Last fragment of a packet
    pub end: bool,
    /// Sequence number, already masked to the session's width
    pub sequence: u32,
}

impl FragmentHeader {
    pub fn new(sequence: u32, begin: bool, end: bool) -> Self {
        Self {
            begin,
            end,
            sequence,
        }
    }

    /// Decode a header from the front of `buf`.
    pub fn decode(buf: &[u8], width: SeqWidth) -> Result<Self, ProtocolError> {
        let expected = width.header_len();
        if buf.len() < expected {
            return Err(ProtocolError::TooShort {
                expected,
                actual: buf.len(),
            });
        }

        match width {
            SeqWidth::Short => {
                let raw = u16::from_be_bytes([buf[0], buf[1]]);
                if raw & SHORT_RESERVED != 0 {
                    return Err(ProtocolError::ReservedBitsSet(u32::from(raw)));
                }
                Ok(Self {
                    begin: raw & SHORT_BEGIN != 0,
                    end: raw & SHORT_END != 0,
                    sequence: u32::from(raw) & width.mask(),
                })
            }
            SeqWidth::Long => {
                let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                if raw & LONG_RESERVED != 0 {
                    return Err(ProtocolError::ReservedBitsSet(raw));
                }
                Ok(Self {
                    begin: raw & LONG_BEGIN != 0,
                    end: raw & LONG_END != 0,
                    sequence: raw & width.mask(),
                })
            }
        }
    }

    /// Append the encoded header to `out`.
    ///
    /// The sequence number must already fit the width; bits above the mask are
    /// dropped rather than allowed to spill into the reserved field.
    pub fn encode_into(&self, width: SeqWidth, out: &mut Vec<u8>) {
        let sequence = self.sequence & width.mask();
        match width {
            SeqWidth::Short => {
                let mut raw = sequence as u16;
                if self.begin {
                    raw |= SHORT_BEGIN;
                }
                if self.end {
                    raw |= SHORT_END;
                }
                out.extend_from_slice(&raw.to_be_bytes());
            }
            SeqWidth::Long => {
                let mut raw = sequence;
                if self.begin {
                    raw |= LONG_BEGIN;
                }
                if self.end {
                    raw |= LONG_END;
                }
                out.extend_from_slice(&raw.to_be_bytes());
            }
        }
    }

    /// Encode the header on its own.
    pub fn encode(&self, width: SeqWidth) -> Vec<u8> {
        let mut buf = Vec::with_capacity(width.header_len());
        self.encode_into(width, &mut buf);
        buf
    }
}

/// A decoded fragment: header plus the bytes it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Split a received frame into header and payload.
    pub fn decode(buf: &[u8], width: SeqWidth) -> Result<Self, ProtocolError> {
        let header = FragmentHeader::decode(buf, width)?;
        Ok(Self {
            header,
            payload: buf[width.header_len()..].to_vec(),
        })
    }

    /// Build a wire frame from a header and a payload slice.
    pub fn encode(header: &FragmentHeader, width: SeqWidth, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(width.header_len() + payload.len());
        header.encode_into(width, &mut buf);
        buf.extend_from_slice(payload);
        buf
    }
}

/// Fragment format errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Fragment too short: expected at least {expected} header bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Fragment header 0x{0:08X} has reserved bits set")]
    ReservedBitsSet(u32),
}
