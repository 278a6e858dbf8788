//! Shoal wire format — the on-wire shape of every peer datagram.
//!
//! Every datagram starts with the same 12-byte header; the packet type
//! selects the payload layout. All multi-byte header fields are
//! big-endian, expressed through zerocopy's byteorder integer types so
//! the struct layout IS the wire layout. Anything that fails to decode
//! is dropped by the caller without a reply.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::chunk::{ChunkHash, DIGEST_LEN};

// ── Sizes ─────────────────────────────────────────────────────────────────────

/// Fixed header length; also the value carried in the `header_len` field.
pub const HEADER_LEN: usize = 12;

/// Largest datagram a peer will emit or accept.
pub const MAX_DATAGRAM: usize = 1400;

/// Largest DATA payload. Sequence `n` carries this many chunk bytes,
/// except possibly the final sequence of a chunk.
pub const MAX_PAYLOAD: usize = 1024;

/// How many 20-byte digests fit in one WHOHAS/IHAVE packet.
/// Larger digest sets are split across consecutive packets.
pub const MAX_DIGESTS: usize = (MAX_DATAGRAM - HEADER_LEN) / DIGEST_LEN;

// ── Packet type ───────────────────────────────────────────────────────────────

/// The six message types of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Which of these digests do you hold? Payload: N × 20-byte digest.
    Whohas = 0,
    /// I hold these digests. Payload: N × 20-byte digest.
    Ihave = 1,
    /// Send me this chunk. Payload: one 20-byte digest.
    Get = 2,
    /// Chunk bytes for sequence `seq`. Payload: up to 1024 bytes.
    Data = 3,
    /// Cumulative acknowledgement of sequence `ack`. No payload.
    Ack = 4,
    /// Upload table full; ask someone else. No payload.
    Denied = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Whohas),
            1 => Ok(PacketType::Ihave),
            2 => Ok(PacketType::Get),
            3 => Ok(PacketType::Data),
            4 => Ok(PacketType::Ack),
            5 => Ok(PacketType::Denied),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// The 12-byte header carried by every datagram.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct PacketHeader {
    /// Packet type, see [`PacketType`].
    kind: u8,
    /// Always [`HEADER_LEN`]. Anything else is discarded.
    header_len: u8,
    /// Total datagram length in bytes, header included.
    pkt_len: U16<BigEndian>,
    /// Sequence number. DATA only; zero elsewhere.
    seq: U32<BigEndian>,
    /// Acknowledged sequence. ACK only; zero elsewhere.
    ack: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; 12]);

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded (or to-be-encoded) datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub seq: u32,
    pub ack: u32,
    pub payload: Bytes,
}

impl Packet {
    fn control(kind: PacketType, payload: Bytes) -> Self {
        Self { kind, seq: 0, ack: 0, payload }
    }

    /// WHOHAS query for up to [`MAX_DIGESTS`] digests.
    pub fn whohas(digests: &[ChunkHash]) -> Self {
        debug_assert!(digests.len() <= MAX_DIGESTS);
        Self::control(PacketType::Whohas, concat_digests(digests))
    }

    /// IHAVE reply listing up to [`MAX_DIGESTS`] held digests.
    pub fn ihave(digests: &[ChunkHash]) -> Self {
        debug_assert!(digests.len() <= MAX_DIGESTS);
        Self::control(PacketType::Ihave, concat_digests(digests))
    }

    /// GET request for a single chunk.
    pub fn get(digest: ChunkHash) -> Self {
        Self::control(PacketType::Get, Bytes::copy_from_slice(digest.as_bytes()))
    }

    /// DATA packet carrying the payload of sequence `seq`.
    pub fn data(seq: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self { kind: PacketType::Data, seq, ack: 0, payload }
    }

    /// Cumulative ACK of sequence `ack`.
    pub fn ack(ack: u32) -> Self {
        Self { kind: PacketType::Ack, seq: 0, ack, payload: Bytes::new() }
    }

    /// DENIED reply, sent when the upload table is full.
    pub fn denied() -> Self {
        Self::control(PacketType::Denied, Bytes::new())
    }

    /// Decode one datagram. Any inconsistency is an error; the caller
    /// drops the datagram silently.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let header = PacketHeader::read_from_prefix(datagram)
            .ok_or(WireError::TooShort(datagram.len()))?;
        if header.header_len as usize != HEADER_LEN {
            return Err(WireError::BadHeaderLen(header.header_len));
        }
        let kind = PacketType::try_from(header.kind)?;
        let declared = header.pkt_len.get() as usize;
        if declared != datagram.len() || declared > MAX_DATAGRAM {
            return Err(WireError::LengthMismatch { declared, actual: datagram.len() });
        }
        Ok(Self {
            kind,
            seq: header.seq.get(),
            ack: header.ack.get(),
            payload: Bytes::copy_from_slice(&datagram[HEADER_LEN..]),
        })
    }

    /// Encode into a fresh datagram buffer.
    pub fn encode(&self) -> Vec<u8> {
        let total = HEADER_LEN + self.payload.len();
        debug_assert!(total <= MAX_DATAGRAM);
        let header = PacketHeader {
            kind: self.kind as u8,
            header_len: HEADER_LEN as u8,
            pkt_len: U16::new(total as u16),
            seq: U32::new(self.seq),
            ack: U32::new(self.ack),
        };
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// The whole digests carried in a WHOHAS/IHAVE/GET payload.
    /// Trailing bytes that do not fill a digest are ignored.
    pub fn digests(&self) -> impl Iterator<Item = ChunkHash> + '_ {
        self.payload.chunks_exact(DIGEST_LEN).filter_map(ChunkHash::from_slice)
    }
}

fn concat_digests(digests: &[ChunkHash]) -> Bytes {
    let mut payload = Vec::with_capacity(digests.len() * DIGEST_LEN);
    for digest in digests {
        payload.extend_from_slice(digest.as_bytes());
    }
    Bytes::from(payload)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a datagram failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short for a header: {0} bytes")]
    TooShort(usize),

    #[error("unknown packet type: {0}")]
    UnknownType(u8),

    #[error("unexpected header length: {0}")]
    BadHeaderLen(u8),

    #[error("declared length {declared} does not match datagram length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
