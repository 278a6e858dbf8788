//! Download-side state — the tasks a peer is assembling and the
//! per-holder receive connections feeding them.
//!
//! A receive connection accepts DATA strictly by sequence number and
//! acknowledges cumulatively, so retransmissions and reordering on the
//! wire never reorder the chunk. Connections refer to their download by
//! output-path key; nothing points back.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use shoal_core::chunk::{ChunkHash, CHUNK_SIZE};

/// A receive connection idle this long is torn down, its holder dropped
/// for that chunk, and the chunk rescheduled elsewhere.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Out-of-order packets buffered per connection. Overflow is dropped
/// and recovered by the sender's retransmission.
pub const REORDER_CAP: usize = 64;

// ── Download task ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    /// WHOHAS sent, collecting IHAVE replies; no chunk bytes yet.
    Discovering,
    /// At least one chunk is streaming in.
    Transferring,
    /// Every requested chunk received; output about to be persisted.
    Done,
}

/// One `DOWNLOAD` command in flight.
#[derive(Debug)]
pub struct DownloadTask {
    pub output: PathBuf,
    /// Digests still to fetch. Shrinks as chunks complete.
    pub remaining: Vec<ChunkHash>,
    /// Accumulating (and completed) chunk bytes, persisted at the end.
    pub received: HashMap<ChunkHash, Vec<u8>>,
    /// Who claims to hold each still-needed chunk.
    pub holders: HashMap<ChunkHash, Vec<SocketAddr>>,
    pub phase: DownloadPhase,
}

impl DownloadTask {
    pub fn new(output: PathBuf, wanted: Vec<ChunkHash>) -> Self {
        Self {
            output,
            remaining: wanted,
            received: HashMap::new(),
            holders: HashMap::new(),
            phase: DownloadPhase::Discovering,
        }
    }

    pub fn needs(&self, digest: &ChunkHash) -> bool {
        self.remaining.contains(digest)
    }

    /// Record a holder for a chunk. Returns false if already known.
    pub fn add_holder(&mut self, digest: ChunkHash, addr: SocketAddr) -> bool {
        let holders = self.holders.entry(digest).or_default();
        if holders.contains(&addr) {
            return false;
        }
        holders.push(addr);
        true
    }

    /// Forget a holder that stalled or served bad bytes.
    pub fn drop_holder(&mut self, digest: ChunkHash, addr: SocketAddr) {
        if let Some(holders) = self.holders.get_mut(&digest) {
            holders.retain(|a| *a != addr);
        }
    }

    /// Mark a chunk received. True once nothing remains.
    pub fn finish_chunk(&mut self, digest: ChunkHash) -> bool {
        self.remaining.retain(|d| *d != digest);
        self.remaining.is_empty()
    }
}

// ── Receive connection ────────────────────────────────────────────────────────

/// What one DATA packet did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    /// In-order payload absorbed (plus any buffered successors).
    /// `ack` is the new cumulative acknowledgement.
    Advanced { ack: u32, complete: bool },
    /// Below the window — already absorbed; echo `ack` back unchanged.
    Duplicate { ack: u32 },
    /// Ahead of the window — buffered (or dropped when full); `ack`
    /// re-states the cumulative position, a duplicate on the sender side.
    Buffered { ack: u32 },
}

/// One live fetch: a chunk streaming in from a single holder.
#[derive(Debug)]
pub struct ReceiveConn {
    pub chunk: ChunkHash,
    /// Output-path key of the owning download.
    pub download: PathBuf,
    expected_seq: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    last_activity: Instant,
}

impl ReceiveConn {
    pub fn new(chunk: ChunkHash, download: PathBuf, now: Instant) -> Self {
        Self {
            chunk,
            download,
            expected_seq: 1,
            reorder: BTreeMap::new(),
            last_activity: now,
        }
    }

    /// Note liveness; called on every DATA arrival.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn stalled(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > STALL_TIMEOUT
    }

    /// Absorb one DATA payload into `buffer`, the chunk accumulator
    /// owned by the download task.
    pub fn accept(&mut self, seq: u32, payload: &[u8], buffer: &mut Vec<u8>) -> DataOutcome {
        if seq == self.expected_seq {
            buffer.extend_from_slice(payload);
            self.expected_seq += 1;
            while let Some(next) = self.reorder.remove(&self.expected_seq) {
                buffer.extend_from_slice(&next);
                self.expected_seq += 1;
            }
            DataOutcome::Advanced {
                ack: self.expected_seq - 1,
                complete: buffer.len() >= CHUNK_SIZE,
            }
        } else if seq < self.expected_seq {
            DataOutcome::Duplicate { ack: seq }
        } else {
            if self.reorder.len() < REORDER_CAP {
                self.reorder.insert(seq, payload.to_vec());
            }
            DataOutcome::Buffered { ack: self.expected_seq - 1 }
        }
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
