//! Owns the UDP socket and turns raw datagrams into decoded, sender-attributed
//! frames. Transient read errors are logged and the loop keeps going;
//! permanent ones tear the reader down, matching how the discovery receive
//! loop this is adapted from treats `recv_from` failures.

use std::net::SocketAddr;
use std::sync::Arc;

use secp256k1::SecretKey;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::codec::{decode, DecodePacketError, MAX_PACKET_SIZE};
use crate::types::Packet;

/// A decoded inbound datagram, tagged with the address it actually arrived
/// from — distinct from whatever `from` endpoint the payload itself claims,
/// which a probe may deliberately falsify.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: SocketAddr,
    pub hash: [u8; 32],
    pub sender: [u8; 64],
    pub packet: Packet,
}

pub struct Socket {
    udp: Arc<UdpSocket>,
    signer: SecretKey,
}

impl Socket {
    pub async fn bind(addr: SocketAddr, signer: SecretKey) -> std::io::Result<Self> {
        let udp = UdpSocket::bind(addr).await?;
        Ok(Self {
            udp: Arc::new(udp),
            signer,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn handle(&self) -> Arc<UdpSocket> {
        self.udp.clone()
    }

    pub fn signer(&self) -> &SecretKey {
        &self.signer
    }

    pub async fn send_to(&self, packet: &Packet, to: SocketAddr) -> std::io::Result<[u8; 32]> {
        let (hash, bytes) = crate::codec::encode(packet, &self.signer);
        self.udp.send_to(&bytes, to).await?;
        Ok(hash)
    }

    /// Runs the read loop until the socket errors out permanently. Decoded
    /// frames are pushed to `inbound`; frames that fail to decode are only
    /// forwarded to `rejected` when the caller supplied a sink for them —
    /// the harness uses this for the probes that want to assert "the target
    /// said nothing back," not just "nothing parseable came back."
    pub async fn run(
        self,
        inbound: mpsc::UnboundedSender<Inbound>,
        rejected: Option<mpsc::UnboundedSender<(SocketAddr, DecodePacketError)>>,
    ) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (read, from) = match self.udp.recv_from(&mut buf).await {
                Ok(result) => result,
                Err(e) => {
                    error!("socket read failed permanently: {e}, stopping receive loop");
                    return;
                }
            };
            debug!("received {read} bytes from {from}");

            match decode(&buf[..read]) {
                Ok(framed) => {
                    let inbound_packet = Inbound {
                        from,
                        hash: framed.hash,
                        sender: framed.sender,
                        packet: framed.packet,
                    };
                    if inbound.send(inbound_packet).is_err() {
                        warn!("inbound channel closed, stopping receive loop");
                        return;
                    }
                }
                Err(e) => {
                    warn!("could not decode packet from {from}: {e}");
                    if let Some(sink) = &rejected {
                        let _ = sink.send((from, e));
                    }
                }
            }
        }
    }
}
