//! Wire codec for segments.
//!
//! All multi-byte fields are big-endian. The sequence and acknowledgment
//! fields are `w` bytes wide, where `w` comes from [`SeqWidth`]:
//!
//! ```text
//! +--------+--------+-------+--------+----------+-----------------+
//! | seq(w) | ack(w) | flags | len(2) | cksum(2) | payload(len)    |
//! +--------+--------+-------+--------+----------+-----------------+
//! ```
//!
//! The checksum is the RFC 1071 Internet checksum over the header (with the
//! checksum field zeroed) followed by the payload.

use bitflags::bitflags;
use thiserror::Error;

use super::seq_space::SeqWidth;

bitflags! {
    /// Control bits of a segment. They combine freely (e.g. `SYN | ACK`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        const SYN = 0b0000_0001;
        const ACK = 0b0000_0010;
        const FIN = 0b0000_0100;
        const RST = 0b0000_1000;
        const DATA = 0b0001_0000;
    }
}

/// Reasons a datagram is not a valid segment.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    #[error("datagram of {0} bytes is shorter than the segment header")]
    Truncated(usize),
    #[error("header declares {declared} payload bytes but {actual} arrived")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch (carried {carried:#06x}, computed {computed:#06x})")]
    Checksum { carried: u16, computed: u16 },
    #[error("unknown flag bits {0:#04x}")]
    UnknownFlags(u8),
    #[error("DATA flag disagrees with payload length")]
    DataFlag,
}

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// A single transmitted unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    seq: u32,
    ack: u32,
    flags: Flags,
    payload: Vec<u8>,
}

impl Segment {
    /// Builds a segment. `DATA` is set exactly when `payload` is non-empty.
    ///
    /// `payload` must not exceed [`MAX_PAYLOAD`] bytes.
    pub fn new(seq: u32, ack: u32, flags: Flags, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let mut flags = flags;
        flags.set(Flags::DATA, !payload.is_empty());
        Self {
            seq,
            ack,
            flags,
            payload,
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is(&self, flags: Flags) -> bool {
        self.flags.contains(flags)
    }

    /// Sequence numbers this segment occupies: its payload plus one for each
    /// of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.contains(Flags::SYN) {
            len += 1;
        }
        if self.flags.contains(Flags::FIN) {
            len += 1;
        }
        len
    }

    pub fn header_len(width: SeqWidth) -> usize {
        2 * width.bytes() + 5
    }

    pub fn encode(&self, width: SeqWidth) -> Vec<u8> {
        let header_len = Self::header_len(width);
        let mut buf = Vec::with_capacity(header_len + self.payload.len());
        put_seq(&mut buf, self.seq, width);
        put_seq(&mut buf, self.ack, width);
        buf.push(self.flags.bits());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.payload);

        let sum = internet_checksum([&buf[..]]);
        buf[header_len - 2..header_len].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8], width: SeqWidth) -> Result<Self, SegmentError> {
        let header_len = Self::header_len(width);
        if buf.len() < header_len {
            return Err(SegmentError::Truncated(buf.len()));
        }
        let w = width.bytes();
        let seq = get_seq(&buf[..w]);
        let ack = get_seq(&buf[w..2 * w]);
        let raw_flags = buf[2 * w];
        let declared = u16::from_be_bytes([buf[2 * w + 1], buf[2 * w + 2]]) as usize;
        let carried = u16::from_be_bytes([buf[2 * w + 3], buf[2 * w + 4]]);
        let payload = &buf[header_len..];

        if payload.len() != declared {
            return Err(SegmentError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        let computed = internet_checksum([&buf[..2 * w + 3], &[0, 0], payload]);
        if computed != carried {
            return Err(SegmentError::Checksum { carried, computed });
        }

        let flags = Flags::from_bits(raw_flags).ok_or(SegmentError::UnknownFlags(raw_flags))?;
        if flags.contains(Flags::DATA) == payload.is_empty() {
            return Err(SegmentError::DataFlag);
        }

        Ok(Self {
            seq,
            ack,
            flags,
            payload: payload.to_vec(),
        })
    }
}

fn put_seq(buf: &mut Vec<u8>, seq: u32, width: SeqWidth) {
    match width {
        SeqWidth::U16 => buf.extend_from_slice(&(seq as u16).to_be_bytes()),
        SeqWidth::U32 => buf.extend_from_slice(&seq.to_be_bytes()),
    }
}

fn get_seq(field: &[u8]) -> u32 {
    field.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

/// RFC 1071 checksum over the concatenation of `parts`.
///
/// Bytes pair up into big-endian words across part boundaries, so an odd
/// sized part does not shift the words that follow it.
fn internet_checksum<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u16 {
    let mut sum: u32 = 0;
    let mut high = true;
    for part in parts {
        for &b in part {
            sum += if high { u32::from(b) << 8 } else { u32::from(b) };
            high = !high;
        }
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
