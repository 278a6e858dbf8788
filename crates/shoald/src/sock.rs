//! The peer's UDP socket, with optional simulator framing.
//!
//! When `SIMULATOR=host:port` is set, every datagram is wrapped in a
//! 16-byte relay header (big-endian node id, src IPv4, dst IPv4, src
//! port, dst port) and exchanged with the simulator instead of the peer
//! directly; inbound frames are unwrapped and frames not addressed to
//! this peer are dropped. Without the variable this is a pass-through
//! UDP socket.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use tokio::net::UdpSocket;

use shoal_core::wire::{Packet, MAX_DATAGRAM};

/// Size of the relay header prepended in simulator mode.
pub const SIM_HEADER_LEN: usize = 16;

/// Receive buffer size covering any datagram plus the relay header.
pub const RECV_BUF: usize = MAX_DATAGRAM + SIM_HEADER_LEN;

/// The environment variable that switches on relay framing.
const SIMULATOR_ENV: &str = "SIMULATOR";

pub struct PeerSocket {
    inner: UdpSocket,
    relay: Option<Relay>,
}

struct Relay {
    addr: SocketAddr,
    node_id: u32,
    local: SocketAddrV4,
}

impl PeerSocket {
    /// Bind the peer's socket, honoring `SIMULATOR` if present.
    pub async fn bind(node_id: u32, addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(addr).await?;
        let relay = match std::env::var(SIMULATOR_ENV) {
            Ok(spec) => {
                let relay = relay_config(&spec, node_id, inner.local_addr()?)?;
                tracing::info!(simulator = %relay.addr, "network simulator active");
                Some(relay)
            }
            Err(_) => None,
        };
        Ok(Self { inner, relay })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Receive one datagram into `buf`. In relay mode the frame header
    /// is stripped in place; `Ok(None)` means a frame was received but
    /// dropped as malformed or misaddressed.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let (len, from) = self.inner.recv_from(buf).await?;
        let Some(relay) = &self.relay else {
            return Ok(Some((len, from)));
        };
        match unwrap_frame(&buf[..len], relay.local) {
            Some(src) => {
                buf.copy_within(SIM_HEADER_LEN..len, 0);
                Ok(Some((len - SIM_HEADER_LEN, SocketAddr::V4(src))))
            }
            None => {
                tracing::debug!(from = %from, "dropping bad relay frame");
                Ok(None)
            }
        }
    }

    /// Encode and send a packet, best-effort. Send failures are logged
    /// and swallowed so packet handlers never unwind.
    pub async fn send_packet(&self, packet: &Packet, to: SocketAddr) {
        tracing::debug!(
            kind = ?packet.kind,
            seq = packet.seq,
            ack = packet.ack,
            peer = %to,
            "send"
        );
        let wire = packet.encode();
        let result = match &self.relay {
            None => self.inner.send_to(&wire, to).await,
            Some(relay) => match to {
                SocketAddr::V4(dst) => {
                    let frame = wrap_frame(relay.node_id, relay.local, dst, &wire);
                    self.inner.send_to(&frame, relay.addr).await
                }
                SocketAddr::V6(_) => {
                    tracing::warn!(peer = %to, "cannot relay to an IPv6 peer");
                    return;
                }
            },
        };
        if let Err(e) = result {
            tracing::warn!(peer = %to, error = %e, "datagram send failed");
        }
    }
}

fn relay_config(spec: &str, node_id: u32, local: SocketAddr) -> io::Result<Relay> {
    let addr = spec
        .to_socket_addrs()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot resolve simulator address {spec:?}"),
            )
        })?;
    let SocketAddr::V4(local) = local else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "simulator framing requires an IPv4 bind address",
        ));
    };
    Ok(Relay { addr, node_id, local })
}

/// Build a relay frame around an encoded datagram.
fn wrap_frame(node_id: u32, src: SocketAddrV4, dst: SocketAddrV4, datagram: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(SIM_HEADER_LEN + datagram.len());
    frame.extend_from_slice(&node_id.to_be_bytes());
    frame.extend_from_slice(&src.ip().octets());
    frame.extend_from_slice(&dst.ip().octets());
    frame.extend_from_slice(&src.port().to_be_bytes());
    frame.extend_from_slice(&dst.port().to_be_bytes());
    frame.extend_from_slice(datagram);
    frame
}

/// Validate a relay frame addressed to `local` and return its source.
fn unwrap_frame(frame: &[u8], local: SocketAddrV4) -> Option<SocketAddrV4> {
    if frame.len() < SIM_HEADER_LEN {
        return None;
    }
    let ip = |at: usize| Ipv4Addr::new(frame[at], frame[at + 1], frame[at + 2], frame[at + 3]);
    let port = |at: usize| u16::from_be_bytes([frame[at], frame[at + 1]]);
    let src = SocketAddrV4::new(ip(4), port(12));
    let dst = SocketAddrV4::new(ip(8), port(14));
    (dst == local).then_some(src)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
