//! End-to-end downloads between whole peers.

use anyhow::Result;
use shoal_core::chunk::ChunkHash;
use shoal_core::inventory::Inventory;
use shoal_core::wire::Packet;

use crate::*;

#[tokio::test]
async fn single_chunk_download_round_trips() -> Result<()> {
    let data = chunk_bytes(0x21);
    let digest = ChunkHash::of(&data);
    let dir = scenario_dir("transfer-single");

    let (socks, roster) = bind_peer_sockets(2).await;
    let mut socks = socks.into_iter();
    let requester = spawn_peer(socks.next().unwrap(), 1, &roster, Inventory::new(), 4, 0);
    let _holder = spawn_peer(
        socks.next().unwrap(),
        2,
        &roster,
        inventory_of(&[(digest, data.clone())]),
        4,
        0,
    );

    let request = write_request_file(&dir, &[digest]);
    let output = dir.join("out.dat");
    requester.download(&request, &output).await;

    let produced = wait_for_output(&output, DOWNLOAD_DEADLINE).await?;
    assert_eq!(produced.len(), 1);
    let bytes = produced.get(&digest).expect("requested digest present");
    assert_eq!(bytes.as_ref(), data.as_slice());
    assert_eq!(ChunkHash::of(bytes), digest);
    Ok(())
}

#[tokio::test]
async fn two_holders_serve_two_chunks() -> Result<()> {
    let data_a = chunk_bytes(0x22);
    let data_b = chunk_bytes(0x23);
    let digest_a = ChunkHash::of(&data_a);
    let digest_b = ChunkHash::of(&data_b);
    let dir = scenario_dir("transfer-pair");

    let (socks, roster) = bind_peer_sockets(3).await;
    let mut socks = socks.into_iter();
    let requester = spawn_peer(socks.next().unwrap(), 1, &roster, Inventory::new(), 4, 0);
    let _holder_a = spawn_peer(
        socks.next().unwrap(),
        2,
        &roster,
        inventory_of(&[(digest_a, data_a.clone())]),
        4,
        0,
    );
    let _holder_b = spawn_peer(
        socks.next().unwrap(),
        3,
        &roster,
        inventory_of(&[(digest_b, data_b.clone())]),
        4,
        0,
    );

    let request = write_request_file(&dir, &[digest_a, digest_b]);
    let output = dir.join("out.dat");
    requester.download(&request, &output).await;

    let produced = wait_for_output(&output, DOWNLOAD_DEADLINE).await?;
    assert_eq!(produced.len(), 2);
    assert_eq!(produced.get(&digest_a).map(|b| b.as_ref()), Some(data_a.as_slice()));
    assert_eq!(produced.get(&digest_b).map(|b| b.as_ref()), Some(data_b.as_slice()));
    Ok(())
}

#[tokio::test]
async fn one_holder_serves_several_chunks_in_turn() -> Result<()> {
    let chunks: Vec<(ChunkHash, Vec<u8>)> = [0x24u8, 0x25, 0x26]
        .iter()
        .map(|seed| {
            let data = chunk_bytes(*seed);
            (ChunkHash::of(&data), data)
        })
        .collect();
    let digests: Vec<ChunkHash> = chunks.iter().map(|(digest, _)| *digest).collect();
    let dir = scenario_dir("transfer-serial");

    let (socks, roster) = bind_peer_sockets(2).await;
    let mut socks = socks.into_iter();
    let requester = spawn_peer(socks.next().unwrap(), 1, &roster, Inventory::new(), 4, 0);
    let _holder = spawn_peer(socks.next().unwrap(), 2, &roster, inventory_of(&chunks), 4, 0);

    let request = write_request_file(&dir, &digests);
    let output = dir.join("out.dat");
    requester.download(&request, &output).await;

    let produced = wait_for_output(&output, DOWNLOAD_DEADLINE).await?;
    assert_eq!(produced.len(), chunks.len());
    for (digest, data) in &chunks {
        assert_eq!(produced.get(digest).map(|b| b.as_ref()), Some(data.as_slice()));
    }
    Ok(())
}

#[tokio::test]
async fn finished_download_can_be_served_back() -> Result<()> {
    let data = chunk_bytes(0x27);
    let digest = ChunkHash::of(&data);
    let dir = scenario_dir("transfer-reserve");

    let (socks, roster) = bind_peer_sockets(3).await;
    let mut socks = socks.into_iter();
    let requester_sock = socks.next().unwrap();
    let holder_sock = socks.next().unwrap();
    let reserver_sock = socks.next().unwrap();

    let requester = spawn_peer(requester_sock, 1, &roster, Inventory::new(), 4, 0);
    let _holder = spawn_peer(
        holder_sock,
        2,
        &roster,
        inventory_of(&[(digest, data.clone())]),
        4,
        0,
    );

    let request = write_request_file(&dir, &[digest]);
    let output = dir.join("out.dat");
    requester.download(&request, &output).await;
    wait_for_output(&output, DOWNLOAD_DEADLINE).await?;

    // a fresh peer starts up with the finished download as its
    // inventory and serves the chunk straight back
    let reserved = Inventory::load(&output)?;
    let reserver = spawn_peer(reserver_sock, 3, &roster, reserved, 4, 0);

    let probe_sock = PeerSocket::bind(9, "127.0.0.1:0".parse().expect("loopback"))
        .await
        .expect("bind probe socket");
    let mut probe = RawPeer::new(probe_sock);
    probe.send(&Packet::get(digest), reserver.addr).await;
    let (bytes, _) = fetch_chunk(&mut probe, reserver.addr, None).await?;
    assert_eq!(bytes, data);
    assert_eq!(ChunkHash::of(&bytes), digest);
    Ok(())
}
