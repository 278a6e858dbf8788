//! Failover — a holder that answers discovery and then disappears is
//! stalled out, and the chunk is re-requested from the next holder.

use std::time::Duration;

use anyhow::Result;
use shoal_core::chunk::ChunkHash;
use shoal_core::inventory::Inventory;
use shoal_core::wire::{Packet, PacketType};

use crate::*;

#[tokio::test]
async fn stalled_holder_fails_over_to_the_next() -> Result<()> {
    let data = chunk_bytes(0x51);
    let digest = ChunkHash::of(&data);
    let dir = scenario_dir("failover");

    let (socks, roster) = bind_peer_sockets(3).await;
    let mut socks = socks.into_iter();
    let requester = spawn_peer(socks.next().unwrap(), 1, &roster, Inventory::new(), 4, 0);
    let mut vanishing = RawPeer::new(socks.next().unwrap());
    let mut backup = RawPeer::new(socks.next().unwrap());

    let request = write_request_file(&dir, &[digest]);
    let output = dir.join("out.dat");
    requester.download(&request, &output).await;

    // the vanishing holder wins discovery, swallows the GET, goes dark
    loop {
        let (packet, from) = vanishing.recv(Duration::from_secs(10)).await?;
        match packet.kind {
            PacketType::Whohas if packet.digests().any(|d| d == digest) => {
                vanishing.send(&Packet::ihave(&[digest]), from).await;
            }
            PacketType::Get => break,
            _ => {}
        }
    }

    // a second holder comes forward; the chunk stays pinned to the dead
    // connection until the stall timer fires
    backup.send(&Packet::ihave(&[digest]), requester.addr).await;
    let from = loop {
        let (packet, from) = backup.recv(Duration::from_secs(30)).await?;
        if packet.kind == PacketType::Get {
            assert_eq!(packet.digests().next(), Some(digest));
            break from;
        }
    };
    assert_eq!(from, requester.addr);

    serve_chunk(&mut backup, requester.addr, &data).await?;

    let produced = wait_for_output(&output, DOWNLOAD_DEADLINE).await?;
    assert_eq!(produced.get(&digest).map(|b| b.as_ref()), Some(data.as_slice()));
    assert_eq!(ChunkHash::of(produced.get(&digest).expect("chunk present")), digest);
    Ok(())
}
