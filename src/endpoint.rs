//! The harness's view of its own address: what it announces to peers, and
//! which peer addresses it is willing to talk to at all. A one-screen
//! prefix matcher does the CIDR work here rather than pulling in a crate
//! for it, the same call the hand-rolled `enode://` parser in
//! [`crate::types`] makes for a similarly small piece of parsing.

use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatModeError {
    #[error("unrecognized nat mode {0:?}")]
    Unrecognized(String),
    #[error("extip mode requires an ip address: {0}")]
    BadExtIp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatMode {
    Any,
    None,
    Upnp,
    Pmp,
    ExtIp(IpAddr),
}

impl FromStr for NatMode {
    type Err = NatModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(NatMode::Any),
            "none" => Ok(NatMode::None),
            "upnp" => Ok(NatMode::Upnp),
            "pmp" => Ok(NatMode::Pmp),
            other => other
                .strip_prefix("extip:")
                .ok_or_else(|| NatModeError::Unrecognized(other.to_string()))
                .and_then(|ip| {
                    ip.parse()
                        .map(NatMode::ExtIp)
                        .map_err(|_| NatModeError::BadExtIp(ip.to_string()))
                }),
        }
    }
}

#[derive(Debug, Error)]
pub enum CidrError {
    #[error("malformed CIDR entry: {0}")]
    Malformed(String),
}

/// A single `ip/prefix_len` entry from `--net-restrict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    fn parse(entry: &str) -> Result<Self, CidrError> {
        let (ip_part, len_part) = entry
            .split_once('/')
            .ok_or_else(|| CidrError::Malformed(entry.to_string()))?;
        let network: IpAddr = ip_part
            .parse()
            .map_err(|_| CidrError::Malformed(entry.to_string()))?;
        let max_len = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len: u8 = len_part
            .parse()
            .map_err(|_| CidrError::Malformed(entry.to_string()))?;
        if prefix_len > max_len {
            return Err(CidrError::Malformed(entry.to_string()));
        }
        Ok(Self { network, prefix_len })
    }

    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = mask_u32(self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = mask_u128(self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn mask_u128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

/// A whitelist of CIDR blocks; an empty whitelist allows everything, which
/// is the default when `--net-restrict` is not supplied.
#[derive(Debug, Clone, Default)]
pub struct NetRestrict {
    blocks: Vec<CidrBlock>,
}

impl NetRestrict {
    pub fn parse(spec: &str) -> Result<Self, CidrError> {
        let blocks = spec
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(CidrBlock::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { blocks })
    }

    pub fn allows(&self, ip: &IpAddr) -> bool {
        self.blocks.is_empty() || self.blocks.iter().any(|b| b.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn empty_restrict_allows_everything() {
        let restrict = NetRestrict::default();
        assert!(restrict.allows(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn restrict_matches_prefix() {
        let restrict = NetRestrict::parse("10.0.0.0/8").unwrap();
        assert!(restrict.allows(&IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(!restrict.allows(&IpAddr::V4(Ipv4Addr::new(11, 1, 2, 3))));
    }

    #[test]
    fn nat_mode_extip_parses() {
        assert_eq!(
            "extip:1.2.3.4".parse::<NatMode>().unwrap(),
            NatMode::ExtIp(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
        );
    }

    #[test]
    fn nat_mode_rejects_unknown() {
        assert!("bogus".parse::<NatMode>().is_err());
    }
}
