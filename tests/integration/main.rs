//! Shoal integration harness.
//!
//! Whole peers run in-process on loopback UDP and are driven through
//! their command channels, so these scenarios run anywhere `cargo test`
//! does — no namespaces, no spawned processes. Raw scripted peers speak
//! the wire format directly where a scenario needs to observe or
//! misbehave at the packet level.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use shoal_core::chunk::{ChunkHash, CHUNK_SIZE};
use shoal_core::config::PeerOptions;
use shoal_core::inventory::Inventory;
use shoal_core::roster::{PeerRecord, Roster};
use shoal_core::wire::{Packet, PacketType, MAX_PAYLOAD};
use shoald::engine::{Command, Engine};
use shoald::sock::{PeerSocket, RECV_BUF};

mod failover;
mod loss;
mod transfer;

/// Ceiling for a whole download to land on disk.
pub const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(80);

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// Deterministic chunk content, distinct per seed.
pub fn chunk_bytes(seed: u8) -> Vec<u8> {
    let mut data = vec![0u8; CHUNK_SIZE];
    let mut state = u32::from(seed).wrapping_mul(2_654_435_761).wrapping_add(1);
    for byte in data.iter_mut() {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *byte = (state >> 24) as u8;
    }
    data
}

pub fn scenario_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("shoal-it-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).expect("create scenario dir");
    dir
}

pub fn inventory_of(chunks: &[(ChunkHash, Vec<u8>)]) -> Inventory {
    let mut inventory = Inventory::new();
    for (digest, data) in chunks {
        inventory.insert(*digest, Bytes::from(data.clone()));
    }
    inventory
}

pub fn write_request_file(dir: &Path, digests: &[ChunkHash]) -> PathBuf {
    let path = dir.join("request.chunkhash");
    let mut text = String::new();
    for (index, digest) in digests.iter().enumerate() {
        text.push_str(&format!("{index} {digest}\n"));
    }
    std::fs::write(&path, text).expect("write request file");
    path
}

// ── Peers ─────────────────────────────────────────────────────────────────────

/// Bind one loopback socket per peer id (1..=count) and build the
/// matching roster. Callers decide which sockets become engines and
/// which stay raw.
pub async fn bind_peer_sockets(count: u32) -> (Vec<PeerSocket>, Roster) {
    let mut socks = Vec::new();
    let mut records = Vec::new();
    for id in 1..=count {
        let sock = PeerSocket::bind(id, "127.0.0.1:0".parse().expect("loopback"))
            .await
            .expect("bind loopback socket");
        records.push(PeerRecord {
            id,
            addr: sock.local_addr().expect("bound socket has an address"),
        });
        socks.push(sock);
    }
    (socks, Roster::from_records(records))
}

/// An engine running as a task inside the test process.
pub struct TestPeer {
    pub id: u32,
    pub addr: SocketAddr,
    pub commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl TestPeer {
    pub async fn download(&self, hash_file: &Path, output: &Path) {
        self.commands
            .send(Command::Download {
                hash_file: hash_file.to_path_buf(),
                output: output.to_path_buf(),
            })
            .await
            .expect("engine still running");
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn spawn_peer(
    sock: PeerSocket,
    id: u32,
    roster: &Roster,
    inventory: Inventory,
    max_conn: usize,
    timeout_secs: u64,
) -> TestPeer {
    let options = PeerOptions {
        identity: id,
        peer_file: PathBuf::from("nodes.map"),
        chunk_file: PathBuf::from("inventory.dat"),
        max_conn,
        verbose: 0,
        timeout_secs,
    };
    let addr = sock.local_addr().expect("bound socket has an address");
    let (commands, command_rx) = mpsc::channel(8);
    let mut engine = Engine::new(&options, roster.clone(), inventory, sock);
    let task = tokio::spawn(async move {
        let _ = engine.run(command_rx).await;
    });
    TestPeer { id, addr, commands, task }
}

/// A scripted peer speaking raw packets.
pub struct RawPeer {
    sock: PeerSocket,
    buf: Vec<u8>,
}

impl RawPeer {
    pub fn new(sock: PeerSocket) -> Self {
        Self { sock, buf: vec![0u8; RECV_BUF] }
    }

    pub fn addr(&self) -> SocketAddr {
        self.sock.local_addr().expect("bound socket has an address")
    }

    pub async fn send(&self, packet: &Packet, to: SocketAddr) {
        self.sock.send_packet(packet, to).await;
    }

    /// Next decodable packet within `wait`, or an error.
    pub async fn recv(&mut self, wait: Duration) -> Result<(Packet, SocketAddr)> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                bail!("timed out waiting for a packet");
            };
            match tokio::time::timeout(remaining, self.sock.recv(&mut self.buf)).await {
                Ok(Ok(Some((len, from)))) => {
                    if let Ok(packet) = Packet::decode(&self.buf[..len]) {
                        return Ok((packet, from));
                    }
                }
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => bail!("socket receive failed: {e}"),
                Err(_) => bail!("timed out waiting for a packet"),
            }
        }
    }

    pub async fn expect_silence(&mut self, wait: Duration) -> Result<()> {
        match self.recv(wait).await {
            Err(_) => Ok(()),
            Ok((packet, from)) => bail!("expected silence, got {:?} from {from}", packet.kind),
        }
    }
}

// ── Wire-level transfer helpers ───────────────────────────────────────────────

/// Receive one chunk as a scripted requester, acknowledging
/// cumulatively; the GET must already have been sent. `drop_first`
/// simulates loss: the first copy of that sequence is discarded
/// unacknowledged. Returns the chunk bytes and how many copies of the
/// dropped sequence were observed (≥ 2 proves a retransmission).
pub async fn fetch_chunk(
    raw: &mut RawPeer,
    holder: SocketAddr,
    drop_first: Option<u32>,
) -> Result<(Vec<u8>, u32)> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut reorder: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
    let mut expected: u32 = 1;
    let mut dropped = false;
    let mut drop_copies = 0u32;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);

    while buffer.len() < CHUNK_SIZE {
        if tokio::time::Instant::now() > deadline {
            bail!("chunk fetch timed out at {} bytes", buffer.len());
        }
        let (packet, from) = raw.recv(Duration::from_secs(10)).await?;
        if from != holder || packet.kind != PacketType::Data {
            continue;
        }
        let seq = packet.seq;
        if Some(seq) == drop_first {
            drop_copies += 1;
            if !dropped {
                dropped = true;
                continue; // the "lost" copy: no ACK, nothing buffered
            }
        }
        if seq == expected {
            buffer.extend_from_slice(&packet.payload);
            expected += 1;
            while let Some(next) = reorder.remove(&expected) {
                buffer.extend_from_slice(&next);
                expected += 1;
            }
            raw.send(&Packet::ack(expected - 1), holder).await;
        } else if seq < expected {
            raw.send(&Packet::ack(seq), holder).await;
        } else {
            reorder.insert(seq, packet.payload.to_vec());
            raw.send(&Packet::ack(expected - 1), holder).await;
        }
    }
    Ok((buffer, drop_copies))
}

/// Serve one chunk as a scripted holder, stop-and-wait: each sequence
/// is resent until the requester's cumulative ACK covers it.
pub async fn serve_chunk(raw: &mut RawPeer, requester: SocketAddr, data: &[u8]) -> Result<()> {
    let total = data.len().div_ceil(MAX_PAYLOAD) as u32;
    for seq in 1..=total {
        let start = (seq as usize - 1) * MAX_PAYLOAD;
        let end = (start + MAX_PAYLOAD).min(data.len());
        let packet = Packet::data(seq, Bytes::copy_from_slice(&data[start..end]));
        let mut attempts = 0;
        loop {
            raw.send(&packet, requester).await;
            match raw.recv(Duration::from_millis(500)).await {
                Ok((reply, from))
                    if from == requester
                        && reply.kind == PacketType::Ack
                        && reply.ack >= seq =>
                {
                    break;
                }
                Ok(_) => continue,
                Err(_) => {
                    attempts += 1;
                    if attempts > 20 {
                        bail!("requester stopped acknowledging at sequence {seq}");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Poll for a completed download and parse it as an inventory.
pub async fn wait_for_output(path: &Path, deadline: Duration) -> Result<Inventory> {
    let start = tokio::time::Instant::now();
    loop {
        if path.exists() {
            // the writer is a single synchronous write, but a half-read
            // race is still possible; retry on decode failure
            if let Ok(inventory) = Inventory::load(path) {
                return Ok(inventory);
            }
        }
        if start.elapsed() > deadline {
            bail!("output {} not produced in time", path.display());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
