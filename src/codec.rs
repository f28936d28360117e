//! Wire framing: `hash(32) ‖ signature(65) ‖ type(1) ‖ payload`.
//!
//! The hash is a content identifier only — it is *not* what authenticates
//! the packet. The signature, computed over `keccak256(type ‖ payload)`, is
//! the actual authentication; the hash merely lets a reader discard garbage
//! in O(1) before touching secp256k1.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::OnceLock;

use bytes::{Buf, BufMut, BytesMut};
use secp256k1::{PublicKey, SecretKey};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::{self, RecoverError};
use crate::types::{decode_payload, Neighbors, Packet, PacketDecodeError, RpcNode};

pub const MAX_PACKET_SIZE: usize = 1280;
const HASH_LEN: usize = 32;
const SIGNATURE_LEN: usize = 65;
const TYPE_LEN: usize = 1;
pub const MIN_PACKET_SIZE: usize = HASH_LEN + SIGNATURE_LEN + TYPE_LEN;

/// The worst-case-sized `RpcNode` a `neighbors` reply can carry: a full
/// IPv6 address and the widest possible ports and public key. Real nodes
/// almost never hit every one of these maximums at once, but the bound has
/// to hold for the ones that do.
fn worst_case_node() -> RpcNode {
    RpcNode {
        ip: IpAddr::V6(Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff)),
        udp_port: u16::MAX,
        tcp_port: u16::MAX,
        public_key: [0xff; 64],
    }
}

fn neighbors_frame_len(count: usize) -> usize {
    let nodes = vec![worst_case_node(); count];
    let payload = Packet::Neighbors(Neighbors {
        nodes,
        expiration: u64::MAX,
    })
    .encode_payload();
    MIN_PACKET_SIZE + payload.len()
}

static MAX_NEIGHBORS: OnceLock<usize> = OnceLock::new();

/// How many worst-case-sized nodes a single `neighbors` packet can carry
/// without exceeding [`MAX_PACKET_SIZE`]. Computed once, by growing a
/// payload of worst-case entries until the frame would no longer fit, then
/// cached — the bound only depends on the encoding, never on a peer.
pub fn max_neighbors() -> usize {
    *MAX_NEIGHBORS.get_or_init(|| {
        let mut count = 0;
        while neighbors_frame_len(count + 1) <= MAX_PACKET_SIZE {
            count += 1;
        }
        count
    })
}

#[derive(Debug, Error)]
pub enum DecodePacketError {
    #[error("packet of {0} bytes is smaller than the minimum frame size")]
    PacketTooSmall(usize),
    #[error("packet of {0} bytes exceeds the {1}-byte cap")]
    PacketTooLarge(usize, usize),
    #[error("declared hash does not match keccak256(signature ‖ type ‖ payload)")]
    BadHash,
    #[error("signature did not recover to a valid public key: {0}")]
    BadSignature(String),
    #[error("{0}")]
    Payload(#[from] PacketDecodeError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl PartialEq for DecodePacketError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::PacketTooSmall(a), Self::PacketTooSmall(b)) => a == b,
            (Self::PacketTooLarge(a0, a1), Self::PacketTooLarge(b0, b1)) => a0 == b0 && a1 == b1,
            (Self::BadHash, Self::BadHash) => true,
            (Self::BadSignature(a), Self::BadSignature(b)) => a == b,
            (Self::Payload(a), Self::Payload(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl Eq for DecodePacketError {}

impl From<RecoverError> for DecodePacketError {
    fn from(err: RecoverError) -> Self {
        DecodePacketError::BadSignature(err.to_string())
    }
}

/// A decoded frame plus the sender's recovered public key. The hash itself
/// is not exposed here — `FramedPacket::ping_hash` below is what `Pong`
/// replies echo back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub hash: [u8; 32],
    pub sender: [u8; 64],
    pub packet: Packet,
}

/// Signs and frames `packet` with `signer`, returning the bytes ready to
/// hand to a socket and the frame's own hash (handed back to the caller so
/// a `Ping` sender can remember which hash a later `Pong` must echo).
pub fn encode(packet: &Packet, signer: &SecretKey) -> ([u8; 32], BytesMut) {
    encode_raw(packet.type_byte(), &packet.encode_payload(), signer)
}

/// Signs and frames an arbitrary `(type_byte, payload)` pair, bypassing the
/// well-formed [`Packet`] encoders entirely. Used by probes that need to
/// send deliberately nonconforming frames — an unknown type byte, or a
/// payload with trailing bytes appended after its RLP list closes.
pub fn encode_raw(type_byte: u8, payload: &[u8], signer: &SecretKey) -> ([u8; 32], BytesMut) {
    let mut signed = Vec::with_capacity(1 + payload.len());
    signed.push(type_byte);
    signed.extend_from_slice(payload);
    let signature_hash = crypto::keccak256(&signed);
    let signature = crypto::sign_recoverable(signer, &signature_hash);

    let mut hashed = Vec::with_capacity(SIGNATURE_LEN + signed.len());
    hashed.extend_from_slice(&signature);
    hashed.extend_from_slice(&signed);
    let hash = crypto::keccak256(&hashed);

    let mut out = BytesMut::with_capacity(HASH_LEN + hashed.len());
    out.extend_from_slice(&hash);
    out.extend_from_slice(&hashed);
    (hash, out)
}

/// Validates and decodes a raw datagram into a [`FramedPacket`].
pub fn decode(buf: &[u8]) -> Result<FramedPacket, DecodePacketError> {
    if buf.len() < MIN_PACKET_SIZE {
        return Err(DecodePacketError::PacketTooSmall(buf.len()));
    }
    if buf.len() > MAX_PACKET_SIZE {
        return Err(DecodePacketError::PacketTooLarge(buf.len(), MAX_PACKET_SIZE));
    }

    let declared_hash = &buf[..HASH_LEN];
    let rest = &buf[HASH_LEN..];
    let computed_hash = crypto::keccak256(rest);
    if declared_hash != computed_hash {
        return Err(DecodePacketError::BadHash);
    }

    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&rest[..SIGNATURE_LEN]);
    let signed = &rest[SIGNATURE_LEN..];
    let type_byte = signed[0];
    let payload = &signed[1..];

    let signature_hash = crypto::keccak256(signed);
    let public_key: PublicKey = crypto::recover_signer(&signature, &signature_hash)?;
    let sender = crypto::public_key_bytes(&public_key);

    let packet = decode_payload(type_byte, payload)?;

    let mut hash = [0u8; 32];
    hash.copy_from_slice(declared_hash);
    Ok(FramedPacket { hash, sender, packet })
}

/// Adapts the pure [`encode`]/[`decode`] pair to `tokio_util`'s codec
/// traits, so the socket layer can drive a `Framed<UdpFramed<...>>`-style
/// read/write loop instead of calling these functions directly.
pub struct PacketCodec {
    pub signer: SecretKey,
}

impl PacketCodec {
    pub fn new(signer: SecretKey) -> Self {
        Self { signer }
    }
}

impl Decoder for PacketCodec {
    type Item = FramedPacket;
    type Error = DecodePacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let framed = decode(src)?;
        src.advance(src.len());
        Ok(Some(framed))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = DecodePacketError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (_hash, encoded) = encode(&item, &self.signer);
        dst.put_slice(&encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endpoint, Ping};
    use rand::rngs::OsRng;
    use secp256k1::SECP256K1;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_ping() -> Packet {
        Packet::Ping(Ping {
            version: 4,
            from: Endpoint {
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                udp_port: 30303,
                tcp_port: 30303,
            },
            to: Endpoint {
                ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
                udp_port: 30303,
                tcp_port: 30303,
            },
            expiration: crypto::expiration_from_now(std::time::Duration::from_secs(20)),
            enr_seq: None,
        })
    }

    #[test]
    fn encode_then_decode_recovers_sender() {
        let (secret_key, public_key) = SECP256K1.generate_keypair(&mut OsRng);
        let (hash, bytes) = encode(&sample_ping(), &secret_key);
        let framed = decode(&bytes).unwrap();
        assert_eq!(framed.hash, hash);
        assert_eq!(framed.sender, crypto::public_key_bytes(&public_key));
        assert_eq!(framed.packet, sample_ping());
    }

    #[test]
    fn tampered_hash_is_rejected() {
        let (secret_key, _) = SECP256K1.generate_keypair(&mut OsRng);
        let (_hash, mut bytes) = encode(&sample_ping(), &secret_key);
        bytes[0] ^= 0xff;
        assert_eq!(decode(&bytes).unwrap_err(), DecodePacketError::BadHash);
    }

    #[test]
    fn undersized_packet_is_rejected() {
        let err = decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, DecodePacketError::PacketTooSmall(10));
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let err = decode(&vec![0u8; MAX_PACKET_SIZE + 1]).unwrap_err();
        assert_eq!(err, DecodePacketError::PacketTooLarge(MAX_PACKET_SIZE + 1, MAX_PACKET_SIZE));
    }

    #[test]
    fn max_neighbors_bound_is_tight() {
        let max = max_neighbors();
        assert!(neighbors_frame_len(max) <= MAX_PACKET_SIZE);
        assert!(neighbors_frame_len(max + 1) > MAX_PACKET_SIZE);
    }
}
