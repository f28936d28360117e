//! End-to-end tests that run the full probe sequence against a minimal
//! in-process mock peer on loopback, standing in for a real discv4 target.

use std::net::SocketAddr;
use std::time::Duration;

use discv4_conform::codec;
use discv4_conform::crypto;
use discv4_conform::driver;
use discv4_conform::types::{Endpoint, FindNode, Neighbors, Packet, Pong};
use rand::rngs::OsRng;
use secp256k1::{SecretKey, SECP256K1};
use tokio::net::UdpSocket;

/// A peer that completes endpoint proofs (answers every ping) and answers
/// `findnode` only once it has pinged the requester itself and gotten a
/// pong back — the bonding rule every probe in this crate is built around.
async fn spawn_bonding_peer() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let signer = SecretKey::new(&mut OsRng);

    let handle = tokio::spawn(async move {
        let mut bonded: Option<SocketAddr> = None;
        let mut buf = vec![0u8; codec::MAX_PACKET_SIZE];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let framed = match codec::decode(&buf[..n]) {
                Ok(f) => f,
                Err(_) => continue,
            };
            match framed.packet {
                Packet::Ping(ping) if !crypto::is_expired(ping.expiration) => {
                    let pong = Packet::Pong(Pong {
                        to: Endpoint {
                            ip: from.ip(),
                            udp_port: from.port(),
                            tcp_port: from.port(),
                        },
                        ping_hash: framed.hash,
                        expiration: crypto::expiration_from_now(Duration::from_secs(20)),
                        enr_seq: None,
                    });
                    let (_h, bytes) = codec::encode(&pong, &signer);
                    let _ = socket.send_to(&bytes, from).await;

                    // Verify the requester back before trusting its findnode,
                    // the same round trip a real discv4 node performs.
                    let verify = Packet::Ping(discv4_conform::types::Ping {
                        version: 4,
                        from: Endpoint { ip: addr.ip(), udp_port: addr.port(), tcp_port: addr.port() },
                        to: Endpoint { ip: from.ip(), udp_port: from.port(), tcp_port: from.port() },
                        expiration: crypto::expiration_from_now(Duration::from_secs(20)),
                        enr_seq: None,
                    });
                    let (verify_hash, verify_bytes) = codec::encode(&verify, &signer);
                    let _ = socket.send_to(&verify_bytes, from).await;

                    if let Ok((n, _)) = socket.recv_from(&mut buf).await {
                        if let Ok(reply) = codec::decode(&buf[..n]) {
                            if let Packet::Pong(p) = reply.packet {
                                if p.ping_hash == verify_hash {
                                    bonded = Some(from);
                                }
                            }
                        }
                    }
                }
                Packet::FindNode(FindNode { expiration, .. })
                    if bonded == Some(from) && !crypto::is_expired(expiration) =>
                {
                    let neighbors = Packet::Neighbors(Neighbors {
                        nodes: vec![],
                        expiration: crypto::expiration_from_now(Duration::from_secs(20)),
                    });
                    let (_h, bytes) = codec::encode(&neighbors, &signer);
                    let _ = socket.send_to(&bytes, from).await;
                }
                _ => {}
            }
        }
    });

    (addr, handle)
}

#[tokio::test]
async fn full_probe_sequence_passes_against_a_conformant_peer() {
    let (target, _peer) = spawn_bonding_peer().await;
    let signer = SecretKey::new(&mut OsRng);
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let report = driver::run(bind_addr, signer, target).await.unwrap();

    for result in &report.results {
        assert!(
            result.passed(),
            "scenario {} failed: expected {:?}, got {:?}",
            result.name,
            result.expected,
            result.outcome
        );
    }
    assert!(report.all_passed());
    assert_eq!(report.results.len(), 11);
}

#[tokio::test]
async fn nonresponsive_peer_fails_the_first_scenario() {
    // Bind a socket and never read from it, so every send vanishes.
    let dead_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = dead_socket.local_addr().unwrap();
    std::mem::forget(dead_socket);

    let signer = SecretKey::new(&mut OsRng);
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let report = driver::run(bind_addr, signer, target).await.unwrap();
    assert_eq!(report.results.len(), 1);
    assert!(!report.all_passed());
    assert_eq!(report.results[0].name, "ping");
}

#[test]
fn secp256k1_context_is_usable() {
    let (_secret, _public) = SECP256K1.generate_keypair(&mut OsRng);
}
