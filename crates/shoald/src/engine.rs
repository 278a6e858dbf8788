//! The peer engine — session tables, packet dispatch, and the reactor.
//!
//! One `Engine` value owns the socket, the inventory, and three tables:
//! downloads keyed by output path, receive connections and send
//! connections keyed by remote address. A single task drives it, so
//! handlers mutate shared state without locks; no handler can preempt
//! another, and no error crosses a handler boundary — anything
//! recoverable becomes state and control returns to the reactor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use shoal_core::chunk::{self, ChunkHash, DIGEST_LEN};
use shoal_core::config::PeerOptions;
use shoal_core::inventory::{self, Inventory};
use shoal_core::roster::Roster;
use shoal_core::wire::{Packet, PacketType, MAX_DIGESTS};

use crate::scheduler::plan_assignments;
use crate::sock::{PeerSocket, RECV_BUF};
use crate::transfer::receive::{DataOutcome, DownloadPhase, DownloadTask, ReceiveConn};
use crate::transfer::upload::{payload_range, AckOutcome, SendConn};

/// Reactor tick; bounds how late a timeout sweep can run.
pub const TICK: Duration = Duration::from_millis(100);

// ── Commands ──────────────────────────────────────────────────────────────────

/// Commands accepted on standard input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Download { hash_file: PathBuf, output: PathBuf },
}

impl Command {
    /// Parse one input line. Unknown commands yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        match fields.next()? {
            "DOWNLOAD" => Some(Command::Download {
                hash_file: PathBuf::from(fields.next()?),
                output: PathBuf::from(fields.next()?),
            }),
            _ => None,
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine {
    sock: PeerSocket,
    identity: u32,
    max_conn: usize,
    fixed_rto: Option<Duration>,
    roster: Roster,
    inventory: Inventory,
    downloads: HashMap<PathBuf, DownloadTask>,
    receives: HashMap<SocketAddr, ReceiveConn>,
    sends: HashMap<SocketAddr, SendConn>,
}

impl Engine {
    pub fn new(options: &PeerOptions, roster: Roster, inventory: Inventory, sock: PeerSocket) -> Self {
        Self {
            sock,
            identity: options.identity,
            max_conn: options.max_conn,
            fixed_rto: options.fixed_rto(),
            roster,
            inventory,
            downloads: HashMap::new(),
            receives: HashMap::new(),
            sends: HashMap::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Drive the engine until the command channel and socket outlive us.
    ///
    /// Waits on the socket and the command channel with a bounded tick;
    /// after every dispatched event the timeout sweeper runs once.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECV_BUF];
        let mut commands_open = true;

        loop {
            tokio::select! {
                received = self.sock.recv(&mut buf) => match received {
                    Ok(Some((len, from))) => self.handle_datagram(from, &buf[..len]).await,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "socket receive failed"),
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },
                _ = tick.tick() => {}
            }
            self.sweep_timeouts().await;
        }
    }

    // ── Command handling ──────────────────────────────────────────────

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Download { hash_file, output } => {
                self.start_download(&hash_file, output).await
            }
        }
    }

    async fn start_download(&mut self, hash_file: &Path, output: PathBuf) {
        let wanted = match chunk::load_request_list(hash_file) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring DOWNLOAD command");
                return;
            }
        };
        if wanted.is_empty() {
            tracing::warn!(file = %hash_file.display(), "request file lists no chunks");
            return;
        }
        tracing::info!(
            output = %output.display(),
            chunks = wanted.len(),
            "starting download"
        );

        let mut task = DownloadTask::new(output.clone(), wanted);

        // chunks already in the inventory need no network round trip
        let held: Vec<ChunkHash> = task
            .remaining
            .iter()
            .filter(|digest| self.inventory.contains(digest))
            .copied()
            .collect();
        for digest in held {
            if let Some(data) = self.inventory.get(&digest) {
                task.received.insert(digest, data.to_vec());
                task.finish_chunk(digest);
            }
        }
        if task.remaining.is_empty() {
            task.phase = DownloadPhase::Done;
            tracing::info!(output = %output.display(), "all chunks already held, persisting");
            if let Err(e) = inventory::write_map(&output, &task.received) {
                tracing::error!(error = %e, "failed to persist download");
            }
            return;
        }

        let digests = task.remaining.clone();
        self.downloads.insert(output, task);

        for batch in digests.chunks(MAX_DIGESTS) {
            let packet = Packet::whohas(batch);
            for peer in self.roster.others(self.identity) {
                self.sock.send_packet(&packet, peer.addr).await;
            }
        }
    }

    // ── Packet dispatch ───────────────────────────────────────────────

    pub async fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "dropping malformed datagram");
                return;
            }
        };
        match packet.kind {
            PacketType::Whohas => self.on_whohas(from, &packet).await,
            PacketType::Ihave => self.on_ihave(from, &packet).await,
            PacketType::Get => self.on_get(from, &packet).await,
            PacketType::Data => self.on_data(from, packet.seq, &packet.payload).await,
            PacketType::Ack => self.on_ack(from, packet.ack).await,
            PacketType::Denied => {
                // no reroute here: the denier still holds the chunk, so
                // the stall timer is what moves us to another holder
                tracing::debug!(peer = %from, "request denied, waiting out the stall");
            }
        }
    }

    async fn on_whohas(&mut self, from: SocketAddr, packet: &Packet) {
        let held: Vec<ChunkHash> = packet
            .digests()
            .filter(|digest| self.inventory.contains(digest))
            .collect();
        if held.is_empty() {
            return;
        }
        tracing::debug!(peer = %from, count = held.len(), "answering WHOHAS");
        for batch in held.chunks(MAX_DIGESTS) {
            self.sock.send_packet(&Packet::ihave(batch), from).await;
        }
    }

    async fn on_ihave(&mut self, from: SocketAddr, packet: &Packet) {
        let offered: Vec<ChunkHash> = packet.digests().collect();
        if offered.is_empty() {
            return;
        }
        for task in self.downloads.values_mut() {
            for digest in &offered {
                if task.needs(digest) && task.add_holder(*digest, from) {
                    tracing::debug!(peer = %from, chunk = %digest, "recorded holder");
                }
            }
        }
        self.run_scheduler().await;
    }

    async fn on_get(&mut self, from: SocketAddr, packet: &Packet) {
        let Some(digest) = packet
            .payload
            .get(..DIGEST_LEN)
            .and_then(ChunkHash::from_slice)
        else {
            tracing::debug!(peer = %from, "dropping GET without a digest");
            return;
        };
        if !self.inventory.contains(&digest) {
            tracing::debug!(peer = %from, chunk = %digest, "GET for a chunk we do not hold");
            return;
        }
        if self.sends.len() >= self.max_conn {
            tracing::info!(peer = %from, chunk = %digest, "upload table full, denying");
            self.sock.send_packet(&Packet::denied(), from).await;
            return;
        }
        tracing::info!(peer = %from, chunk = %digest, "starting upload");
        self.sends.insert(from, SendConn::new(digest, self.fixed_rto));
        self.pump_upload(from).await;
    }

    async fn on_data(&mut self, from: SocketAddr, seq: u32, payload: &[u8]) {
        let now = Instant::now();
        let Some(conn) = self.receives.get_mut(&from) else {
            tracing::debug!(peer = %from, "DATA from an address without a connection");
            return;
        };
        conn.touch(now);
        let Some(task) = self.downloads.get_mut(&conn.download) else {
            return;
        };
        if task.phase == DownloadPhase::Discovering {
            tracing::debug!(output = %task.output.display(), "download is transferring");
            task.phase = DownloadPhase::Transferring;
        }
        let buffer = task.received.entry(conn.chunk).or_default();
        let (ack, complete) = match conn.accept(seq, payload, buffer) {
            DataOutcome::Advanced { ack, complete } => (ack, complete),
            DataOutcome::Duplicate { ack } => (ack, false),
            DataOutcome::Buffered { ack } => (ack, false),
        };
        self.sock.send_packet(&Packet::ack(ack), from).await;
        if complete {
            self.finish_chunk(from).await;
        }
    }

    async fn on_ack(&mut self, from: SocketAddr, ack: u32) {
        let now = Instant::now();
        let Some(conn) = self.sends.get_mut(&from) else {
            return;
        };
        match conn.register_ack(ack, now) {
            AckOutcome::Advanced { complete: true } => {
                tracing::info!(peer = %from, chunk = %conn.chunk, "upload complete");
                self.sends.remove(&from);
            }
            AckOutcome::Advanced { complete: false } => self.pump_upload(from).await,
            AckOutcome::FastRetransmit => {
                tracing::debug!(peer = %from, seq = ack + 1, "fast retransmit");
                self.retransmit(from, ack + 1).await;
            }
            AckOutcome::Ignored => {}
        }
    }

    // ── Upload plumbing ───────────────────────────────────────────────

    /// Fill the congestion window with fresh sequences.
    async fn pump_upload(&mut self, to: SocketAddr) {
        loop {
            let now = Instant::now();
            let Some(conn) = self.sends.get_mut(&to) else { return };
            let Some(data) = self.inventory.get(&conn.chunk) else {
                tracing::warn!(peer = %to, chunk = %conn.chunk, "chunk missing from inventory, aborting upload");
                self.sends.remove(&to);
                return;
            };
            let Some(seq) = conn.next_to_send(data.len(), now) else { return };
            let Some(range) = payload_range(seq, data.len()) else { return };
            let packet = Packet::data(seq, data.slice(range));
            self.sock.send_packet(&packet, to).await;
        }
    }

    async fn retransmit(&self, to: SocketAddr, seq: u32) {
        let Some(conn) = self.sends.get(&to) else { return };
        let Some(data) = self.inventory.get(&conn.chunk) else { return };
        let Some(range) = payload_range(seq, data.len()) else { return };
        let packet = Packet::data(seq, data.slice(range));
        self.sock.send_packet(&packet, to).await;
    }

    // ── Download plumbing ─────────────────────────────────────────────

    /// A receive connection has a full chunk in its buffer.
    async fn finish_chunk(&mut self, from: SocketAddr) {
        let Some(conn) = self.receives.remove(&from) else { return };
        let Some(task) = self.downloads.get_mut(&conn.download) else { return };
        let Some(buffer) = task.received.get(&conn.chunk) else { return };

        let digest = ChunkHash::of(buffer);
        if digest != conn.chunk {
            tracing::warn!(
                peer = %from,
                expected = %conn.chunk,
                got = %digest,
                "chunk failed its digest check, rescheduling"
            );
            task.received.remove(&conn.chunk);
            task.drop_holder(conn.chunk, from);
            self.run_scheduler().await;
            return;
        }

        tracing::info!(peer = %from, chunk = %conn.chunk, "chunk complete");
        self.inventory.insert(conn.chunk, Bytes::copy_from_slice(buffer));

        if task.finish_chunk(conn.chunk) {
            task.phase = DownloadPhase::Done;
            tracing::info!(output = %task.output.display(), "download complete, persisting");
            if let Err(e) = inventory::write_map(&task.output, &task.received) {
                tracing::error!(error = %e, "failed to persist download");
            }
            self.downloads.remove(&conn.download);
        }
        self.run_scheduler().await;
    }

    /// Issue GETs for every assignment the scheduler can make right now.
    async fn run_scheduler(&mut self) {
        let plan = plan_assignments(&self.downloads, &self.receives);
        for assignment in plan {
            tracing::info!(
                peer = %assignment.addr,
                chunk = %assignment.chunk,
                "requesting chunk"
            );
            self.sock
                .send_packet(&Packet::get(assignment.chunk), assignment.addr)
                .await;
            self.receives.insert(
                assignment.addr,
                ReceiveConn::new(assignment.chunk, assignment.download, Instant::now()),
            );
        }
    }

    // ── Timers ────────────────────────────────────────────────────────

    /// Walk both connection tables once: retransmit timed-out uploads,
    /// tear down stalled holders and reschedule their chunks.
    pub async fn sweep_timeouts(&mut self) {
        let now = Instant::now();

        let expired: Vec<(SocketAddr, u32)> = self
            .sends
            .iter_mut()
            .filter_map(|(addr, conn)| conn.check_timeout(now).map(|seq| (*addr, seq)))
            .collect();
        for (addr, seq) in expired {
            tracing::debug!(peer = %addr, seq, "retransmission timeout");
            self.retransmit(addr, seq).await;
        }

        let stalled: Vec<SocketAddr> = self
            .receives
            .iter()
            .filter(|(_, conn)| conn.stalled(now))
            .map(|(addr, _)| *addr)
            .collect();
        if stalled.is_empty() {
            return;
        }
        for addr in stalled {
            let Some(conn) = self.receives.remove(&addr) else { continue };
            tracing::warn!(peer = %addr, chunk = %conn.chunk, "holder stalled, rescheduling");
            if let Some(task) = self.downloads.get_mut(&conn.download) {
                task.drop_holder(conn.chunk, addr);
                task.received.remove(&conn.chunk);
            }
        }
        self.run_scheduler().await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
