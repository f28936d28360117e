//! The probes a scenario is built out of, and the `Harness` they run
//! against: a bound socket, a signing key, and a matcher handle, plus a
//! small background task that always answers inbound `Ping`s the way any
//! well-behaved peer must, so a target can complete its own endpoint proof
//! of the harness before trusting a `findnode` from it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use secp256k1::{SecretKey, SECP256K1};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{self, MAX_PACKET_SIZE};
use crate::crypto;
use crate::endpoint::NetRestrict;
use crate::error::{HarnessError, MatcherError};
use crate::matcher::{self, Expectation, MatcherHandle, RESPONSE_TIMEOUT};
use crate::socket::{Inbound, Socket};
use crate::types::{Endpoint, FindNode, Neighbors, NodeId, Packet, Ping, Pong, RpcNode};

const PAST_TTL: Duration = Duration::from_secs(3600);
/// Settle time after bonding before a probe's next step, matching the
/// fixed 2-second gap the bonded scenarios are specified with.
const POST_BOND_SETTLE: Duration = Duration::from_secs(2);

pub struct Harness {
    udp: Arc<UdpSocket>,
    signer: SecretKey,
    local: Endpoint,
    matcher: MatcherHandle,
    _reader: JoinHandle<()>,
    _dispatcher: JoinHandle<()>,
}

impl Harness {
    pub async fn bind(bind_addr: SocketAddr, signer: SecretKey) -> Result<Self, HarnessError> {
        Self::bind_with(bind_addr, signer, None, NetRestrict::default()).await
    }

    /// Like [`Harness::bind`], but announces `announce_ip` instead of the
    /// bind address's own IP (the `--nat extip:<ip>` case) and silently
    /// drops any datagram from a peer `restrict` doesn't allow, the way
    /// `--net-restrict` is specified to behave: such peers aren't answered
    /// and never reach the matcher.
    pub async fn bind_with(
        bind_addr: SocketAddr,
        signer: SecretKey,
        announce_ip: Option<IpAddr>,
        restrict: NetRestrict,
    ) -> Result<Self, HarnessError> {
        let socket = Socket::bind(bind_addr, signer.clone()).await?;
        let local_addr = socket.local_addr()?;
        let udp = socket.handle();

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Inbound>();
        let reader = tokio::spawn(socket.run(raw_tx, None));

        let (matcher_tx, matcher_rx) = mpsc::unbounded_channel();
        let matcher = matcher::spawn(matcher_rx);

        let responder_udp = udp.clone();
        let responder_signer = signer.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(inbound) = raw_rx.recv().await {
                if !restrict.allows(&inbound.from.ip()) {
                    warn!("dropping datagram from restricted peer {}", inbound.from);
                    continue;
                }
                if let Packet::Ping(_) = &inbound.packet {
                    let pong = Packet::Pong(Pong {
                        to: Endpoint {
                            ip: inbound.from.ip(),
                            udp_port: inbound.from.port(),
                            tcp_port: inbound.from.port(),
                        },
                        ping_hash: inbound.hash,
                        expiration: crypto::expiration_from_now(Duration::from_secs(20)),
                        enr_seq: None,
                    });
                    let (_hash, bytes) = codec::encode(&pong, &responder_signer);
                    if let Err(e) = responder_udp.send_to(&bytes, inbound.from).await {
                        debug!("failed to auto-answer ping from {}: {e}", inbound.from);
                    }
                }
                if matcher_tx.send(inbound).is_err() {
                    return;
                }
            }
        });

        Ok(Self {
            udp,
            signer,
            local: Endpoint {
                ip: announce_ip.unwrap_or_else(|| local_addr.ip()),
                udp_port: local_addr.port(),
                tcp_port: local_addr.port(),
            },
            matcher,
            _reader: reader,
            _dispatcher: dispatcher,
        })
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    async fn send(&self, packet: &Packet, to: SocketAddr) -> Result<[u8; 32], HarnessError> {
        let (hash, bytes) = codec::encode(packet, &self.signer);
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(HarnessError::Config(format!(
                "encoded packet of {} bytes exceeds the {MAX_PACKET_SIZE}-byte cap",
                bytes.len()
            )));
        }
        self.udp.send_to(&bytes, to).await?;
        Ok(hash)
    }

    async fn send_raw(&self, type_byte: u8, payload: &[u8], to: SocketAddr) -> Result<[u8; 32], HarnessError> {
        let (hash, bytes) = codec::encode_raw(type_byte, payload, &self.signer);
        self.udp.send_to(&bytes, to).await?;
        Ok(hash)
    }
}

impl Drop for Harness {
    /// Tasks spawned in `bind` outlive a dropped `JoinHandle` unless told
    /// otherwise, so a harness going out of scope would otherwise leak its
    /// reader and auto-responder and keep the bound port alive.
    fn drop(&mut self) {
        self._reader.abort();
        self._dispatcher.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Ok,
    Timeout,
}

pub struct ProbeReport {
    pub name: &'static str,
    pub expected: Expected,
    pub outcome: Result<Packet, MatcherError>,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        matches!(
            (self.expected, &self.outcome),
            (Expected::Ok, Ok(_)) | (Expected::Timeout, Err(MatcherError::Timeout))
        )
    }
}

fn random_target() -> [u8; 64] {
    let (_secret, public) = SECP256K1.generate_keypair(&mut OsRng);
    crypto::public_key_bytes(&public)
}

fn well_formed_ping(from: Endpoint, to: Endpoint) -> Ping {
    Ping {
        version: 4,
        from,
        to,
        expiration: crypto::expiration_from_now(Duration::from_secs(20)),
        enr_seq: None,
    }
}

async fn expect_pong(
    harness: &Harness,
    target: SocketAddr,
    ping_hash: [u8; 32],
) -> Result<Packet, MatcherError> {
    expect_pong_validated(harness, target, ping_hash, None).await
}

/// Like [`expect_pong`], but additionally rejects a pong recovered from a
/// key other than `expected_id` (`UnknownNode`) instead of accepting any
/// correctly-shaped reply. This is the `validate=true` path `ping` uses to
/// check the target really is who it claims to be.
async fn expect_pong_validated(
    harness: &Harness,
    target: SocketAddr,
    ping_hash: [u8; 32],
    expected_id: Option<NodeId>,
) -> Result<Packet, MatcherError> {
    harness
        .matcher
        .wait_for(target, Expectation::Pong { ping_hash, expected_id }, RESPONSE_TIMEOUT)
        .await
}

async fn expect_neighbors(harness: &Harness, target: SocketAddr) -> Result<Packet, MatcherError> {
    expect_neighbors_checked(harness, target, None).await
}

/// Like [`expect_neighbors`], but rejects a reply that echoes back
/// `injected_fake` (`CorruptDht`) — the DHT-poisoning check `bonded_findnode`
/// runs after planting a fake entry.
async fn expect_neighbors_checked(
    harness: &Harness,
    target: SocketAddr,
    injected_fake: Option<NodeId>,
) -> Result<Packet, MatcherError> {
    harness
        .matcher
        .wait_for(target, Expectation::Neighbors { injected_fake }, RESPONSE_TIMEOUT)
        .await
}

/// Completes the endpoint proof against `target`: sends a normal ping and
/// waits for its pong. The target's own verifying ping back to us is
/// answered by the background responder installed in [`Harness::bind`],
/// with no explicit wait needed here.
async fn bond(harness: &Harness, target: SocketAddr) -> Result<(), MatcherError> {
    let ping = Packet::Ping(well_formed_ping(harness.local, endpoint_of(target)));
    let hash = harness.send(&ping, target).await.map_err(|_| MatcherError::Closed)?;
    expect_pong(harness, target, hash).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

fn endpoint_of(addr: SocketAddr) -> Endpoint {
    Endpoint {
        ip: addr.ip(),
        udp_port: addr.port(),
        tcp_port: addr.port(),
    }
}

/// `expected_id`, when set, is the target's advertised node id: the reply's
/// sender key is recovered and checked against it, rejecting with
/// `UnknownNode` if the peer that answered isn't the one we dialed.
pub async fn ping(harness: &Harness, target: SocketAddr, expected_id: Option<NodeId>) -> ProbeReport {
    let ping = Packet::Ping(well_formed_ping(harness.local, endpoint_of(target)));
    let outcome = match harness.send(&ping, target).await {
        Ok(hash) => expect_pong_validated(harness, target, hash, expected_id).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping",
        expected: Expected::Ok,
        outcome,
    }
}

pub async fn ping_wrong_from(harness: &Harness, target: SocketAddr) -> ProbeReport {
    let mut from = harness.local;
    from.ip = "203.0.113.7".parse().expect("valid test IP");
    let ping = Packet::Ping(well_formed_ping(from, endpoint_of(target)));
    let outcome = match harness.send(&ping, target).await {
        Ok(hash) => expect_pong(harness, target, hash).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping_wrong_from",
        expected: Expected::Ok,
        outcome,
    }
}

pub async fn ping_wrong_to(harness: &Harness, target: SocketAddr) -> ProbeReport {
    let mut to = endpoint_of(target);
    to.ip = "203.0.113.8".parse().expect("valid test IP");
    let ping = Packet::Ping(well_formed_ping(harness.local, to));
    let outcome = match harness.send(&ping, target).await {
        Ok(hash) => expect_pong(harness, target, hash).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping_wrong_to",
        expected: Expected::Ok,
        outcome,
    }
}

pub async fn ping_extra_data(harness: &Harness, target: SocketAddr) -> ProbeReport {
    let ping = well_formed_ping(harness.local, endpoint_of(target));
    let mut payload = Packet::Ping(ping).encode_payload();
    payload.extend_from_slice(b"conformance probe trailing bytes");
    let outcome = match harness.send_raw(1, &payload, target).await {
        Ok(hash) => expect_pong(harness, target, hash).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping_extra_data",
        expected: Expected::Ok,
        outcome,
    }
}

/// Combines `ping_extra_data`'s trailing bytes with `ping_wrong_from`'s
/// bogus `from` IP in one packet — a conformant target must still answer
/// this the same way it answers a plain `ping`.
pub async fn ping_extra_data_wrong_from(harness: &Harness, target: SocketAddr) -> ProbeReport {
    let mut from = harness.local;
    from.ip = "203.0.113.11".parse().expect("valid test IP");
    let ping = well_formed_ping(from, endpoint_of(target));
    let mut payload = Packet::Ping(ping).encode_payload();
    payload.extend_from_slice(b"conformance probe trailing bytes");
    let outcome = match harness.send_raw(1, &payload, target).await {
        Ok(hash) => expect_pong(harness, target, hash).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping_extra_data_wrong_from",
        expected: Expected::Ok,
        outcome,
    }
}

pub async fn ping_wrong_packet_type(harness: &Harness, target: SocketAddr) -> ProbeReport {
    let ping = well_formed_ping(harness.local, endpoint_of(target));
    let payload = Packet::Ping(ping).encode_payload();
    const UNUSED_TYPE: u8 = 9;
    let outcome = match harness.send_raw(UNUSED_TYPE, &payload, target).await {
        Ok(hash) => expect_pong(harness, target, hash).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping_wrong_packet_type",
        expected: Expected::Timeout,
        outcome,
    }
}

pub async fn findnode_without_bond(harness: &Harness, target: SocketAddr) -> ProbeReport {
    let find_node = Packet::FindNode(FindNode {
        target: random_target(),
        expiration: crypto::expiration_from_now(Duration::from_secs(20)),
    });
    let outcome = match harness.send(&find_node, target).await {
        Ok(_) => expect_neighbors(harness, target).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "findnode_without_bond",
        expected: Expected::Timeout,
        outcome,
    }
}

pub async fn ping_bonded_with_mangled_from(harness: &Harness, target: SocketAddr) -> ProbeReport {
    if bond(harness, target).await.is_err() {
        return ProbeReport {
            name: "ping_bonded_with_mangled_from",
            expected: Expected::Ok,
            outcome: Err(MatcherError::Timeout),
        };
    }
    tokio::time::sleep(POST_BOND_SETTLE).await;
    let mut from = harness.local;
    from.ip = "203.0.113.9".parse().expect("valid test IP");
    let ping = Packet::Ping(well_formed_ping(from, endpoint_of(target)));
    let outcome = match harness.send(&ping, target).await {
        Ok(hash) => expect_pong(harness, target, hash).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping_bonded_with_mangled_from",
        expected: Expected::Ok,
        outcome,
    }
}

/// Bonds, then plants a forged unsolicited `Neighbors` reply containing a
/// node we invented, before issuing the real `findnode`. A target that
/// absorbed the injected entry into its own table would hand it right back
/// in its legitimate reply; seeing it come back is indistinguishable from
/// the target having been DHT-poisoned by an unsolicited packet, so that
/// case fails the probe with `CorruptDht` instead of passing.
pub async fn bonded_findnode(harness: &Harness, target: SocketAddr) -> ProbeReport {
    if bond(harness, target).await.is_err() {
        return ProbeReport {
            name: "bonded_findnode",
            expected: Expected::Ok,
            outcome: Err(MatcherError::Timeout),
        };
    }
    tokio::time::sleep(POST_BOND_SETTLE).await;

    let fake = RpcNode {
        ip: "198.51.100.7".parse().expect("valid test IP"),
        udp_port: 30303,
        tcp_port: 30303,
        public_key: random_target(),
    };
    let fake_id = fake.node_id();
    let spoofed = Packet::Neighbors(Neighbors {
        nodes: vec![fake],
        expiration: crypto::expiration_from_now(Duration::from_secs(20)),
    });

    let outcome = match harness.send(&spoofed, target).await {
        Ok(_) => {
            let find_node = Packet::FindNode(FindNode {
                target: random_target(),
                expiration: crypto::expiration_from_now(Duration::from_secs(20)),
            });
            match harness.send(&find_node, target).await {
                Ok(_) => expect_neighbors_checked(harness, target, Some(fake_id)).await,
                Err(_) => Err(MatcherError::Closed),
            }
        }
        Err(_) => Err(MatcherError::Closed),
    };

    ProbeReport {
        name: "bonded_findnode",
        expected: Expected::Ok,
        outcome,
    }
}

pub async fn ping_past_expiration(harness: &Harness, target: SocketAddr) -> ProbeReport {
    let mut ping = well_formed_ping(harness.local, endpoint_of(target));
    ping.expiration = crypto::current_unix_time().saturating_sub(PAST_TTL.as_secs());
    let outcome = match harness.send(&Packet::Ping(ping), target).await {
        Ok(hash) => expect_pong(harness, target, hash).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "ping_past_expiration",
        expected: Expected::Timeout,
        outcome,
    }
}

pub async fn findnode_past_expiration(harness: &Harness, target: SocketAddr) -> ProbeReport {
    if bond(harness, target).await.is_err() {
        return ProbeReport {
            name: "findnode_past_expiration",
            expected: Expected::Timeout,
            outcome: Err(MatcherError::Timeout),
        };
    }
    let find_node = Packet::FindNode(FindNode {
        target: random_target(),
        expiration: crypto::current_unix_time().saturating_sub(PAST_TTL.as_secs()),
    });
    let outcome = match harness.send(&find_node, target).await {
        Ok(_) => expect_neighbors(harness, target).await,
        Err(_) => Err(MatcherError::Closed),
    };
    ProbeReport {
        name: "findnode_past_expiration",
        expected: Expected::Timeout,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Neighbors as NeighborsPayload;

    async fn mock_peer_echo_pong() -> (SocketAddr, SecretKey, JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let signer = SecretKey::new(&mut OsRng);
        let task_signer = signer;
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let framed = match codec::decode(&buf[..n]) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                if let Packet::Ping(_) = framed.packet {
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
                    let (_h, bytes) = codec::encode(&pong, &task_signer);
                    let _ = socket.send_to(&bytes, from).await;
                }
            }
        });
        (addr, signer, handle)
    }

    #[tokio::test]
    async fn ping_against_responsive_peer_succeeds() {
        let (peer_addr, _peer_signer, _peer) = mock_peer_echo_pong().await;
        let harness = Harness::bind("127.0.0.1:0".parse().unwrap(), SecretKey::new(&mut OsRng))
            .await
            .unwrap();

        let report = ping(&harness, peer_addr, None).await;
        assert!(report.passed(), "ping probe should have succeeded");
    }

    #[tokio::test]
    async fn findnode_without_bond_times_out_against_strict_peer() {
        // A peer that answers pings but never answers findnode (because it
        // never validated the requester) should make this probe pass, since
        // the probe itself expects a Timeout.
        let (peer_addr, _peer_signer, _peer) = mock_peer_echo_pong().await;
        let harness = Harness::bind("127.0.0.1:0".parse().unwrap(), SecretKey::new(&mut OsRng))
            .await
            .unwrap();

        let report = findnode_without_bond(&harness, peer_addr).await;
        assert!(report.passed());
    }

    #[test]
    fn neighbors_payload_type_is_reachable() {
        let _ = NeighborsPayload {
            nodes: vec![],
            expiration: 0,
        };
    }

    #[tokio::test]
    async fn ping_extra_data_wrong_from_against_responsive_peer_succeeds() {
        let (peer_addr, _peer_signer, _peer) = mock_peer_echo_pong().await;
        let harness = Harness::bind("127.0.0.1:0".parse().unwrap(), SecretKey::new(&mut OsRng))
            .await
            .unwrap();

        let report = ping_extra_data_wrong_from(&harness, peer_addr).await;
        assert!(report.passed(), "ping_extra_data_wrong_from should have succeeded");
    }

    /// A peer that naively folds any `Neighbors` it receives — solicited or
    /// not — into whatever it hands back on the next `findnode` it answers.
    /// `bonded_findnode` plants a fake entry this way specifically to catch
    /// that behaviour.
    async fn mock_naive_peer() -> (SocketAddr, JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let signer = SecretKey::new(&mut OsRng);

        let handle = tokio::spawn(async move {
            let mut bonded: Option<SocketAddr> = None;
            let mut absorbed: Vec<RpcNode> = Vec::new();
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
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
                    Packet::Ping(_) => {
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

                        let verify = Packet::Ping(well_formed_ping(
                            Endpoint { ip: addr.ip(), udp_port: addr.port(), tcp_port: addr.port() },
                            Endpoint { ip: from.ip(), udp_port: from.port(), tcp_port: from.port() },
                        ));
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
                    Packet::Neighbors(neighbors) => {
                        absorbed.extend(neighbors.nodes);
                    }
                    Packet::FindNode(_) if bonded == Some(from) => {
                        let neighbors = Packet::Neighbors(NeighborsPayload {
                            nodes: absorbed.clone(),
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
    async fn bonded_findnode_rejects_a_peer_that_echoes_the_injected_fake() {
        let (peer_addr, _peer) = mock_naive_peer().await;
        let harness = Harness::bind("127.0.0.1:0".parse().unwrap(), SecretKey::new(&mut OsRng))
            .await
            .unwrap();

        let report = bonded_findnode(&harness, peer_addr).await;
        assert_eq!(report.outcome.unwrap_err(), MatcherError::CorruptDht);
    }
}
