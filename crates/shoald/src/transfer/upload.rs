//! Upload reliability — per-connection congestion control for one chunk
//! being served to one peer.
//!
//! Classic AIMD with slow start and fast retransmit. The state machine
//! is pure: it decides *what* to (re)transmit and the engine does the
//! socket work, which keeps the arithmetic testable without a network.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use shoal_core::chunk::{ChunkHash, CHUNK_SIZE};
use shoal_core::wire::MAX_PAYLOAD;

/// Slow-start threshold a fresh connection starts with.
pub const INITIAL_SSTHRESH: u32 = 64;

/// The duplicate-ACK count that triggers a fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// Clamp bounds for the adaptive retransmission timeout, seconds.
const MIN_RTO: f64 = 0.2;
const MAX_RTO: f64 = 4.0;

/// Retransmission timer — fixed by `-t`, or estimated from RTT samples.
#[derive(Debug)]
enum RetransmitTimer {
    Fixed(Duration),
    Adaptive { estimated: f64, dev: f64, rto: f64 },
}

impl RetransmitTimer {
    fn new(fixed: Option<Duration>) -> Self {
        match fixed {
            Some(rto) => Self::Fixed(rto),
            // Until the first sample arrives, assume a one-second round trip.
            None => Self::Adaptive { estimated: 1.0, dev: 0.0, rto: 1.0 },
        }
    }

    fn current(&self) -> Duration {
        match self {
            Self::Fixed(rto) => *rto,
            Self::Adaptive { rto, .. } => Duration::from_secs_f64(*rto),
        }
    }

    fn record_sample(&mut self, sample: Duration) {
        if let Self::Adaptive { estimated, dev, rto } = self {
            let sample = sample.as_secs_f64();
            *estimated = 0.85 * *estimated + 0.15 * sample;
            *dev = 0.7 * *dev + 0.3 * (sample - *estimated).abs();
            *rto = (*estimated + 4.0 * *dev).clamp(MIN_RTO, MAX_RTO);
        }
    }
}

/// What an inbound ACK did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Fresh cumulative ACK. `complete` once the whole chunk is acked.
    Advanced { complete: bool },
    /// Third duplicate ACK — retransmit `last_ack + 1` now.
    FastRetransmit,
    /// Duplicate below the threshold, or a stale ACK.
    Ignored,
}

/// One live upload: a chunk being streamed to a single requester.
#[derive(Debug)]
pub struct SendConn {
    pub chunk: ChunkHash,
    cwnd: f64,
    ssthresh: u32,
    last_ack: u32,
    last_sent: u32,
    dup_acks: u32,
    timer: RetransmitTimer,
    sent_at: HashMap<u32, Instant>,
}

impl SendConn {
    pub fn new(chunk: ChunkHash, fixed_rto: Option<Duration>) -> Self {
        Self {
            chunk,
            cwnd: 1.0,
            ssthresh: INITIAL_SSTHRESH,
            last_ack: 0,
            last_sent: 0,
            dup_acks: 0,
            timer: RetransmitTimer::new(fixed_rto),
            sent_at: HashMap::new(),
        }
    }

    /// The next unsent sequence if the window has room, stamping its
    /// send time. `total_len` is the chunk length in bytes.
    pub fn next_to_send(&mut self, total_len: usize, now: Instant) -> Option<u32> {
        if self.in_flight() >= self.cwnd as u32 {
            return None;
        }
        let next = self.last_sent + 1;
        if (next as usize - 1) * MAX_PAYLOAD >= total_len {
            return None;
        }
        self.last_sent = next;
        self.sent_at.insert(next, now);
        Some(next)
    }

    /// Fold in one cumulative ACK.
    pub fn register_ack(&mut self, ack: u32, now: Instant) -> AckOutcome {
        if ack > self.last_ack {
            self.last_ack = ack;
            self.dup_acks = 0;
            if let Some(sent) = self.sent_at.remove(&ack) {
                self.timer.record_sample(now.duration_since(sent));
            }
            self.sent_at.retain(|seq, _| *seq > ack);
            if self.cwnd < self.ssthresh as f64 {
                self.cwnd += 1.0;
            } else {
                self.cwnd += 1.0 / self.cwnd;
            }
            AckOutcome::Advanced { complete: self.is_complete() }
        } else if ack == self.last_ack {
            self.dup_acks += 1;
            if self.dup_acks == DUP_ACK_THRESHOLD {
                self.enter_recovery();
                AckOutcome::FastRetransmit
            } else {
                AckOutcome::Ignored
            }
        } else {
            AckOutcome::Ignored
        }
    }

    /// The sequence to retransmit if `last_ack + 1` has sat unacked past
    /// the RTO. Refreshes its stamp and applies the decrease.
    pub fn check_timeout(&mut self, now: Instant) -> Option<u32> {
        let seq = self.last_ack + 1;
        let sent = self.sent_at.get_mut(&seq)?;
        if now.duration_since(*sent) <= self.timer.current() {
            return None;
        }
        *sent = now;
        self.enter_recovery();
        Some(seq)
    }

    fn enter_recovery(&mut self) {
        self.ssthresh = (self.cwnd as u32 / 2).max(2);
        self.cwnd = 1.0;
    }

    /// Cumulative ACK has covered the whole chunk. The only completion
    /// signal there is — the protocol has no explicit end-of-upload.
    pub fn is_complete(&self) -> bool {
        self.last_ack as usize * MAX_PAYLOAD >= CHUNK_SIZE
    }

    pub fn in_flight(&self) -> u32 {
        self.last_sent - self.last_ack
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    pub fn rto(&self) -> Duration {
        self.timer.current()
    }
}

/// Chunk byte range carried by a sequence number, or `None` when the
/// sequence lies past the end of the chunk.
pub fn payload_range(seq: u32, total_len: usize) -> Option<std::ops::Range<usize>> {
    let start = (seq as usize).checked_sub(1)? * MAX_PAYLOAD;
    if start >= total_len {
        return None;
    }
    Some(start..(start + MAX_PAYLOAD).min(total_len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
