//! Wire-level data types: endpoints, node ids, and the four packet variants
//! the discv4 wire format defines. Kept free of socket and signing concerns;
//! see [`crate::codec`] for how these get wrapped into signed frames.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use secp256k1::PublicKey;
use thiserror::Error;

use crate::rlp::{Decoder, Encoder, RlpDecode, RlpDecodeError, RlpEncode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; 32]);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }
}

impl RlpEncode for Endpoint {
    fn rlp_encode(&self, buf: &mut Vec<u8>) {
        Encoder::new()
            .field(&self.ip)
            .field(&self.udp_port)
            .field(&self.tcp_port)
            .finish(buf);
    }
}

impl RlpDecode for Endpoint {
    fn rlp_decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RlpDecodeError> {
        let mut decoder = Decoder::new(rlp)?;
        let ip = decoder.field("ip")?;
        let udp_port = decoder.field("udp_port")?;
        let tcp_port = decoder.field("tcp_port")?;
        Ok((
            Endpoint {
                ip,
                udp_port,
                tcp_port,
            },
            decoder.remaining(),
        ))
    }
}

/// A peer as referenced inside a `Neighbors` payload: endpoint plus identity,
/// distinct from `Endpoint` which carries no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcNode {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: [u8; 64],
}

impl RpcNode {
    pub fn node_id(&self) -> NodeId {
        NodeId(crate::crypto::keccak256(&self.public_key))
    }
}

impl RlpEncode for RpcNode {
    fn rlp_encode(&self, buf: &mut Vec<u8>) {
        Encoder::new()
            .field(&self.ip)
            .field(&self.udp_port)
            .field(&self.tcp_port)
            .bytes_field(&self.public_key)
            .finish(buf);
    }
}

impl RlpDecode for RpcNode {
    fn rlp_decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RlpDecodeError> {
        let mut decoder = Decoder::new(rlp)?;
        let ip = decoder.field("ip")?;
        let udp_port = decoder.field("udp_port")?;
        let tcp_port = decoder.field("tcp_port")?;
        let public_key_bytes = decoder.bytes_field("public_key")?;
        if public_key_bytes.len() != 64 {
            return Err(RlpDecodeError::InvalidLength);
        }
        let mut public_key = [0u8; 64];
        public_key.copy_from_slice(&public_key_bytes);
        Ok((
            RpcNode {
                ip,
                udp_port,
                tcp_port,
                public_key,
            },
            decoder.remaining(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u32,
    pub from: Endpoint,
    pub to: Endpoint,
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    pub ping_hash: [u8; 32],
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: [u8; 64],
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    pub nodes: Vec<RpcNode>,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
}

impl Packet {
    pub fn type_byte(&self) -> u8 {
        match self {
            Packet::Ping(_) => 1,
            Packet::Pong(_) => 2,
            Packet::FindNode(_) => 3,
            Packet::Neighbors(_) => 4,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            Packet::Ping(p) => p.expiration,
            Packet::Pong(p) => p.expiration,
            Packet::FindNode(f) => f.expiration,
            Packet::Neighbors(n) => n.expiration,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Packet::Ping(p) => {
                let mut encoder = Encoder::new()
                    .field(&p.version)
                    .field(&p.from)
                    .field(&p.to)
                    .field(&p.expiration);
                if let Some(seq) = p.enr_seq {
                    encoder = encoder.field(&seq);
                }
                encoder.finish(&mut buf);
            }
            Packet::Pong(p) => {
                let mut encoder = Encoder::new()
                    .field(&p.to)
                    .bytes_field(&p.ping_hash)
                    .field(&p.expiration);
                if let Some(seq) = p.enr_seq {
                    encoder = encoder.field(&seq);
                }
                encoder.finish(&mut buf);
            }
            Packet::FindNode(f) => {
                Encoder::new()
                    .bytes_field(&f.target)
                    .field(&f.expiration)
                    .finish(&mut buf);
            }
            Packet::Neighbors(n) => {
                Encoder::new()
                    .field(&n.nodes)
                    .field(&n.expiration)
                    .finish(&mut buf);
            }
        }
        buf
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketDecodeError {
    #[error("unknown packet type byte {0}")]
    UnknownType(u8),
    #[error("rlp decode error: {0}")]
    Rlp(#[from] RlpDecodeError),
}

pub fn decode_payload(type_byte: u8, payload: &[u8]) -> Result<Packet, PacketDecodeError> {
    match type_byte {
        1 => {
            let mut decoder = Decoder::new(payload)?;
            let version = decoder.field("version")?;
            let from = decoder.field("from")?;
            let to = decoder.field("to")?;
            let expiration = decoder.field("expiration")?;
            let enr_seq = decoder.field::<u64>("enr_seq").ok();
            Ok(Packet::Ping(Ping {
                version,
                from,
                to,
                expiration,
                enr_seq,
            }))
        }
        2 => {
            let mut decoder = Decoder::new(payload)?;
            let to = decoder.field("to")?;
            let ping_hash_bytes = decoder.bytes_field("ping_hash")?;
            let expiration = decoder.field("expiration")?;
            let enr_seq = decoder.field::<u64>("enr_seq").ok();
            if ping_hash_bytes.len() != 32 {
                return Err(RlpDecodeError::InvalidLength.into());
            }
            let mut ping_hash = [0u8; 32];
            ping_hash.copy_from_slice(&ping_hash_bytes);
            Ok(Packet::Pong(Pong {
                to,
                ping_hash,
                expiration,
                enr_seq,
            }))
        }
        3 => {
            let mut decoder = Decoder::new(payload)?;
            let target_bytes = decoder.bytes_field("target")?;
            let expiration = decoder.field("expiration")?;
            if target_bytes.len() != 64 {
                return Err(RlpDecodeError::InvalidLength.into());
            }
            let mut target = [0u8; 64];
            target.copy_from_slice(&target_bytes);
            Ok(Packet::FindNode(FindNode { target, expiration }))
        }
        4 => {
            let mut decoder = Decoder::new(payload)?;
            let nodes = decoder.field("nodes")?;
            let expiration = decoder.field("expiration")?;
            Ok(Packet::Neighbors(Neighbors { nodes, expiration }))
        }
        other => Err(PacketDecodeError::UnknownType(other)),
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid enode url: {0}")]
    InvalidFormat(String),
    #[error("could not parse field: {0}")]
    ParseError(String),
}

/// A fully addressed peer, as parsed from an `enode://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub public_key: [u8; 64],
}

impl Node {
    pub fn node_id(&self) -> NodeId {
        NodeId(crate::crypto::keccak256(&self.public_key))
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.udp_port)
    }

    pub fn from_public_key(public_key: &PublicKey, ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
            public_key: crate::crypto::public_key_bytes(public_key),
        }
    }

    pub fn from_enode_url(enode: &str) -> Result<Self, NodeError> {
        if !enode.starts_with("enode://") {
            return Err(NodeError::InvalidFormat(
                "missing enode:// scheme".to_string(),
            ));
        }
        let public_key_hex = enode
            .get(8..136)
            .ok_or_else(|| NodeError::ParseError("public key field too short".into()))?;
        let public_key_vec =
            hex::decode(public_key_hex).map_err(|_| NodeError::ParseError("public key not hex".into()))?;
        if public_key_vec.len() != 64 {
            return Err(NodeError::ParseError("public key must be 64 bytes".into()));
        }
        let mut public_key = [0u8; 64];
        public_key.copy_from_slice(&public_key_vec);

        let address_part = enode
            .get(137..)
            .ok_or_else(|| NodeError::ParseError("missing host:port".into()))?;
        let address_part = match address_part.find('?') {
            Some(pos) => &address_part[..pos],
            None => address_part,
        };
        let socket_addr = SocketAddr::from_str(address_part)
            .map_err(|_| NodeError::ParseError("could not parse socket address".into()))?;
        let tcp_port = socket_addr.port();
        let udp_port = match enode.find("?discport=") {
            Some(pos) => enode[pos + "?discport=".len()..]
                .parse()
                .map_err(|_| NodeError::ParseError("could not parse discport".into()))?,
            None => tcp_port,
        };

        Ok(Self {
            ip: socket_addr.ip(),
            udp_port,
            tcp_port,
            public_key,
        })
    }

    pub fn enode_url(&self) -> String {
        let public_key = hex::encode(self.public_key);
        if self.udp_port != self.tcp_port {
            format!(
                "enode://{public_key}@{}:{}?discport={}",
                self.ip, self.tcp_port, self.udp_port
            )
        } else {
            format!("enode://{public_key}@{}:{}", self.ip, self.tcp_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ping_payload_roundtrip() {
        let ping = Packet::Ping(Ping {
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
            expiration: 123456,
            enr_seq: None,
        });
        let payload = ping.encode_payload();
        let decoded = decode_payload(1, &payload).unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn neighbors_payload_roundtrip() {
        let node = RpcNode {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            udp_port: 30303,
            tcp_port: 30303,
            public_key: [7u8; 64],
        };
        let neighbors = Packet::Neighbors(Neighbors {
            nodes: vec![node.clone(), node],
            expiration: 999,
        });
        let payload = neighbors.encode_payload();
        let decoded = decode_payload(4, &payload).unwrap();
        assert_eq!(decoded, neighbors);
    }

    #[test]
    fn enode_url_roundtrip() {
        let url = format!("enode://{}@127.0.0.1:30303", hex::encode([9u8; 64]));
        let node = Node::from_enode_url(&url).unwrap();
        assert_eq!(node.tcp_port, 30303);
        assert_eq!(node.udp_port, 30303);
        assert_eq!(node.public_key, [9u8; 64]);
    }

    #[test]
    fn unknown_type_byte_errors() {
        let err = decode_payload(9, &[0xc0]).unwrap_err();
        assert_eq!(err, PacketDecodeError::UnknownType(9));
    }
}
