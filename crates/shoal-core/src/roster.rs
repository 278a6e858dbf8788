//! Peer roster — the static table of peers this engine may talk to.
//!
//! Loaded once at startup and never mutated. The engine's own identity
//! selects its bind address from this table.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// One `<id> <host> <port>` roster line, resolved.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: u32,
    pub addr: SocketAddr,
}

/// The full peer table.
#[derive(Debug, Clone)]
pub struct Roster {
    peers: Vec<PeerRecord>,
}

impl Roster {
    /// Load and resolve a roster file. Lines starting with `#` are comments.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RosterError::Read(path.to_path_buf(), e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, RosterError> {
        let mut peers = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(id), Some(host), Some(port)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(RosterError::Malformed(number + 1));
            };
            let id: u32 = id.parse().map_err(|_| RosterError::Malformed(number + 1))?;
            let port: u16 = port.parse().map_err(|_| RosterError::Malformed(number + 1))?;
            let addr = resolve(host, port)
                .ok_or_else(|| RosterError::Unresolvable(number + 1, host.to_string()))?;
            peers.push(PeerRecord { id, addr });
        }
        Ok(Self { peers })
    }

    /// Build a roster from already-resolved records.
    pub fn from_records(peers: Vec<PeerRecord>) -> Self {
        Self { peers }
    }

    pub fn get(&self, id: u32) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Every peer except `id` — the broadcast set for WHOHAS.
    pub fn others(&self, id: u32) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter().filter(move |p| p.id != id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Resolve a host/port pair, preferring IPv4 (the simulator framing is
/// IPv4-only).
fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    let mut addrs: Vec<SocketAddr> = (host, port).to_socket_addrs().ok()?.collect();
    addrs.sort_by_key(|a| !a.is_ipv4());
    addrs.into_iter().next()
}

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("line {0}: expected '<id> <host> <port>'")]
    Malformed(usize),

    #[error("line {0}: cannot resolve host {1:?}")]
    Unresolvable(usize, String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
