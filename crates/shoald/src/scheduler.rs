//! Chunk-to-peer assignment — rarest-holder-first.
//!
//! Planning is a pure pass over the session tables; the engine turns
//! the plan into GET packets and fresh receive connections. Chunks with
//! few claimed holders are requested first, so scarce chunks are not
//! starved behind widely-replicated ones.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;

use shoal_core::chunk::ChunkHash;

use crate::transfer::receive::{DownloadTask, ReceiveConn};

/// One GET the scheduler decided to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub addr: SocketAddr,
    pub chunk: ChunkHash,
    pub download: PathBuf,
}

/// Pick a holder for every needed chunk that can be fetched right now.
///
/// Per pass: chunks ascend by holder count; a chunk already under an
/// active receive connection is skipped (at most one fetch per chunk),
/// and each holder address hosts at most one connection.
pub fn plan_assignments(
    downloads: &HashMap<PathBuf, DownloadTask>,
    receives: &HashMap<SocketAddr, ReceiveConn>,
) -> Vec<Assignment> {
    let mut fetching: HashSet<ChunkHash> = receives.values().map(|c| c.chunk).collect();
    let mut busy: HashSet<SocketAddr> = receives.keys().copied().collect();

    let mut plan = Vec::new();
    for (path, task) in downloads {
        let mut wanted: Vec<(&ChunkHash, &Vec<SocketAddr>)> = task
            .remaining
            .iter()
            .filter_map(|digest| task.holders.get(digest).map(|peers| (digest, peers)))
            .filter(|(_, peers)| !peers.is_empty())
            .collect();
        wanted.sort_by_key(|(_, peers)| peers.len());

        for (digest, peers) in wanted {
            if fetching.contains(digest) {
                continue;
            }
            let Some(addr) = peers.iter().find(|addr| !busy.contains(addr)) else {
                continue;
            };
            fetching.insert(*digest);
            busy.insert(*addr);
            plan.push(Assignment {
                addr: *addr,
                chunk: *digest,
                download: path.clone(),
            });
        }
    }
    plan
}

// ── Tests ─────────────────────────────────────────────────────────────────────
