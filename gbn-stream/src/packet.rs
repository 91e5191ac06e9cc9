//! Wire-format definitions for GBN packets.
//!
//! Every datagram exchanged between sender and receiver is a [`Packet`].
//! This module is responsible for:
//! - Defining the on-wire binary layout (header fields, kind, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], rejecting
//!   truncated, inconsistent or corrupted input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |     Kind      |  Payload Len  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  (cont.)      |           Checksum            |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 7 bytes.
//! seq(2) + kind(1) + payload_len(2) + checksum(2)
//!
//! The checksum is the RFC 1071 Internet checksum over the whole packet with
//! the checksum field zeroed, i.e. over the header minus the checksum field
//! plus the payload.  ACKs are protected exactly like DATA.

use thiserror::Error;

use crate::seq::Seq;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 7;

/// Largest payload that fits in one IPv4 UDP datagram with our header.
pub const MAX_PAYLOAD: usize = 65_507 - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_KIND: usize = 2;
const OFF_PAYLOAD_LEN: usize = 3;
const OFF_CHECKSUM: usize = 5;

/// What a packet means to the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// A chunk of the byte stream.
    Data,
    /// Cumulative acknowledgement of `seq` and everything before it.
    Ack,
    /// End of stream; occupies one sequence number like DATA.
    Eof,
}

impl PacketKind {
    fn to_u8(self) -> u8 {
        match self {
            PacketKind::Data => 0,
            PacketKind::Ack => 1,
            PacketKind::Eof => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketKind::Data),
            1 => Some(PacketKind::Ack),
            2 => Some(PacketKind::Eof),
            _ => None,
        }
    }
}

/// A complete protocol datagram.
///
/// The checksum is not stored: [`Packet::encode`] computes it and
/// [`Packet::decode`] verifies it, so a decoded packet compares equal to the
/// one that was encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: Seq,
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn data(seq: Seq, payload: Vec<u8>) -> Self {
        Self {
            seq,
            kind: PacketKind::Data,
            payload,
        }
    }

    pub fn ack(seq: Seq) -> Self {
        Self {
            seq,
            kind: PacketKind::Ack,
            payload: Vec::new(),
        }
    }

    pub fn eof(seq: Seq) -> Self {
        Self {
            seq,
            kind: PacketKind::Eof,
            payload: Vec::new(),
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// Fails when the payload does not fit in a datagram or when an ACK or
    /// EOF carries payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        check_empty(self.kind, payload_len)?;

        let mut buf = vec![0u8; HEADER_LEN + payload_len];
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_KIND] = self.kind.to_u8();
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        // Checksum field stays zero while computing the checksum.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Any error means the datagram must be treated as if it never arrived;
    /// nothing from a failed decode is trusted.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated(buf.len()));
        }

        let payload_len = u16::from_be_bytes([buf[OFF_PAYLOAD_LEN], buf[OFF_PAYLOAD_LEN + 1]]);
        if buf.len() != HEADER_LEN + payload_len as usize {
            return Err(PacketError::LengthMismatch {
                declared: payload_len as usize,
                actual: buf.len() - HEADER_LEN,
            });
        }

        let checksum = u16::from_be_bytes([buf[OFF_CHECKSUM], buf[OFF_CHECKSUM + 1]]);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        if internet_checksum(&scratch) != checksum {
            return Err(PacketError::ChecksumMismatch);
        }

        let kind =
            PacketKind::from_u8(buf[OFF_KIND]).ok_or(PacketError::UnknownKind(buf[OFF_KIND]))?;
        check_empty(kind, payload_len as usize)?;

        Ok(Packet {
            seq: u16::from_be_bytes([buf[OFF_SEQ], buf[OFF_SEQ + 1]]),
            kind,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when building or parsing a datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("datagram of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated(usize),
    #[error("payload_len field says {declared} bytes but {actual} follow the header")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum verification failed")]
    ChecksumMismatch,
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("ACK packets carry no payload")]
    AckWithPayload,
    #[error("EOF packets carry no payload")]
    EofWithPayload,
    #[error("payload of {0} bytes exceeds the datagram limit")]
    PayloadTooLarge(usize),
}

/// Only DATA packets may carry payload bytes.
fn check_empty(kind: PacketKind, payload_len: usize) -> Result<(), PacketError> {
    match kind {
        _ if payload_len == 0 => Ok(()),
        PacketKind::Ack => Err(PacketError::AckWithPayload),
        PacketKind::Eof => Err(PacketError::EofWithPayload),
        PacketKind::Data => Ok(()),
    }
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    // Odd trailing byte: pad with a zero on the right.
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
