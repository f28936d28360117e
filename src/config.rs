//! Command-line configuration surface, in the same dotted-flag,
//! `help_heading`-grouped style as the node's own CLI options struct.

use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use secp256k1::SecretKey;

use crate::endpoint::{NatMode, NetRestrict};
use crate::error::HarnessError;
use crate::types::Node;

#[derive(Debug, Parser)]
#[command(name = "discv4-conform", about = "Conformance probe runner for discv4-style discovery peers")]
pub struct Options {
    #[arg(
        long = "private-key",
        env = "DISCV4_CONFORM_PRIVATE_KEY",
        value_name = "HEX_SECRET_KEY",
        help = "Hex-encoded secp256k1 private key the harness signs packets with.",
        help_heading = "Harness options"
    )]
    pub private_key: String,

    #[arg(
        long = "listen-port",
        default_value = "30303",
        value_name = "PORT",
        help = "UDP port the harness binds to.",
        help_heading = "Harness options"
    )]
    pub listen_port: u16,

    #[arg(
        long = "announce-address",
        value_name = "IP",
        help = "IP address advertised in outgoing endpoints, if different from the bind address.",
        help_heading = "Harness options"
    )]
    pub announce_address: Option<IpAddr>,

    #[arg(
        long = "nat",
        default_value = "any",
        value_name = "NAT_MODE",
        help = "NAT traversal mode: any, none, upnp, pmp, or extip:<ip>.",
        help_heading = "Harness options"
    )]
    pub nat: String,

    #[arg(
        long = "net-restrict",
        value_name = "CIDR_LIST",
        help = "Comma separated CIDR blocks; peers outside all of them are ignored.",
        help_heading = "Harness options"
    )]
    pub net_restrict: Option<String>,

    #[arg(
        long = "target-enode",
        value_name = "ENODE_URL",
        help = "enode:// URL of the peer to run probes against.",
        help_heading = "Target options"
    )]
    pub target_enode: Option<String>,

    #[arg(
        long = "target-ip",
        value_name = "IP",
        help = "Overrides the target's IP address from --target-enode.",
        help_heading = "Target options"
    )]
    pub target_ip: Option<IpAddr>,
}

pub struct Config {
    pub signer: SecretKey,
    pub bind_addr: SocketAddr,
    pub announce_address: Option<IpAddr>,
    pub nat: NatMode,
    pub net_restrict: NetRestrict,
    pub target: Node,
}

impl Options {
    pub fn into_config(self) -> Result<Config, HarnessError> {
        let key_bytes = hex::decode(self.private_key.trim_start_matches("0x"))
            .map_err(|e| HarnessError::Config(format!("private key is not valid hex: {e}")))?;
        let signer = SecretKey::from_slice(&key_bytes)
            .map_err(|e| HarnessError::Config(format!("private key is not a valid secp256k1 scalar: {e}")))?;

        let nat: NatMode = self
            .nat
            .parse()
            .map_err(|e: crate::endpoint::NatModeError| HarnessError::Config(e.to_string()))?;

        let net_restrict = match &self.net_restrict {
            Some(spec) => NetRestrict::parse(spec).map_err(|e| HarnessError::Config(e.to_string()))?,
            None => NetRestrict::default(),
        };

        let target_enode = self
            .target_enode
            .as_deref()
            .ok_or_else(|| HarnessError::Config("--target-enode is required".to_string()))?;
        let mut target = Node::from_enode_url(target_enode)?;
        if let Some(ip) = self.target_ip {
            target.ip = ip;
        }

        let bind_ip = self.announce_address.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        let bind_addr = SocketAddr::new(bind_ip, self.listen_port);

        Ok(Config {
            signer,
            bind_addr,
            announce_address: self.announce_address,
            nat,
            net_restrict,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_minimal_args() {
        let opts = Options::parse_from([
            "discv4-conform",
            "--private-key",
            "0101010101010101010101010101010101010101010101010101010101010101",
            "--target-enode",
            &format!("enode://{}@127.0.0.1:30303", hex::encode([3u8; 64])),
        ]);
        let config = opts.into_config().unwrap();
        assert_eq!(config.bind_addr.port(), 30303);
        assert_eq!(config.target.tcp_port, 30303);
    }

    #[test]
    fn rejects_missing_target() {
        let opts = Options::parse_from([
            "discv4-conform",
            "--private-key",
            "0101010101010101010101010101010101010101010101010101010101010101",
        ]);
        assert!(opts.into_config().is_err());
    }
}
