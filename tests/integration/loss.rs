//! Loss recovery — a dropped DATA packet is retransmitted and the
//! transfer completes intact.

use anyhow::Result;
use shoal_core::chunk::ChunkHash;
use shoal_core::wire::Packet;

use crate::*;

#[tokio::test]
async fn dropped_data_packet_is_retransmitted() -> Result<()> {
    let data = chunk_bytes(0x31);
    let digest = ChunkHash::of(&data);

    let (socks, roster) = bind_peer_sockets(2).await;
    let mut socks = socks.into_iter();
    // fixed 1 s RTO keeps the recovery timing deterministic
    let holder = spawn_peer(
        socks.next().unwrap(),
        1,
        &roster,
        inventory_of(&[(digest, data.clone())]),
        4,
        1,
    );
    let mut probe = RawPeer::new(socks.next().unwrap());

    probe.send(&Packet::get(digest), holder.addr).await;
    let (bytes, copies_of_dropped) = fetch_chunk(&mut probe, holder.addr, Some(3)).await?;

    assert!(
        copies_of_dropped >= 2,
        "expected at least one retransmission of the dropped sequence, saw {copies_of_dropped} copies"
    );
    assert_eq!(bytes, data);
    assert_eq!(ChunkHash::of(&bytes), digest);
    Ok(())
}
