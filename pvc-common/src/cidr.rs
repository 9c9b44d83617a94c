//! IPv4 CIDR handling for the underlay and managed networks.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CidrError {
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("invalid prefix length: {0}")]
    InvalidPrefix(u8),
    #[error("address {addr} not contained in {net}")]
    NotContained { addr: Ipv4Addr, net: String },
    #[error("network {0} has no host number {1}")]
    NoSuchHost(String, u32),
}

/// An IPv4 address with a prefix length.
///
/// The address part may be a host address (a gateway or floating address
/// with its netmask) or the network address itself; [`Ipv4Cidr::network`]
/// normalizes either form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::InvalidPrefix(prefix));
        }
        Ok(Ipv4Cidr { addr, prefix })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    /// The enclosing network with the address bits below the prefix cleared.
    pub fn network(&self) -> Ipv4Cidr {
        Ipv4Cidr {
            addr: Ipv4Addr::from(u32::from(self.addr) & self.mask()),
            prefix: self.prefix,
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(addr) & self.mask()) == u32::from(self.network().addr)
    }

    /// True if `addr` is a usable host address of this network (inside the
    /// network and neither the network nor the broadcast address).
    pub fn contains_host(&self, addr: Ipv4Addr) -> bool {
        if !self.contains(addr) {
            return false;
        }
        if self.prefix >= 31 {
            // point-to-point networks have no network/broadcast addresses
            return true;
        }
        let raw = u32::from(addr);
        raw != u32::from(self.network().addr) && raw != self.broadcast_raw()
    }

    fn broadcast_raw(&self) -> u32 {
        u32::from(self.network().addr) | !self.mask()
    }

    /// The `n`-th usable host address, counting from zero.
    ///
    /// Host zero is the first address after the network address. Used for
    /// `node_ip_selection: by-id`, where node N takes host N-1.
    pub fn nth_host(&self, n: u32) -> Result<Ipv4Addr, CidrError> {
        let first = u32::from(self.network().addr) + if self.prefix >= 31 { 0 } else { 1 };
        let candidate = first
            .checked_add(n)
            .ok_or_else(|| CidrError::NoSuchHost(self.to_string(), n))?;
        let addr = Ipv4Addr::from(candidate);
        if !self.contains_host(addr) {
            return Err(CidrError::NoSuchHost(self.network().to_string(), n));
        }
        Ok(addr)
    }

    /// Host addresses between `start` and `end` inclusive, for DHCP pools.
    pub fn host_range(&self, start: Ipv4Addr, end: Ipv4Addr) -> Result<(), CidrError> {
        for addr in [start, end] {
            if !self.contains_host(addr) {
                return Err(CidrError::NotContained {
                    addr,
                    net: self.network().to_string(),
                });
            }
        }
        Ok(())
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match value.split_once('/') {
            Some((addr, prefix)) => (addr, prefix),
            None => return Err(CidrError::InvalidCidr(value.to_owned())),
        };
        let addr = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| CidrError::InvalidCidr(value.to_owned()))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| CidrError::InvalidCidr(value.to_owned()))?;
        Ipv4Cidr::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_display_roundtrip() {
        let net = cidr("10.0.1.0/24");
        assert_eq!(net.to_string(), "10.0.1.0/24");
        assert_eq!(net.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!("10.0.1.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.1.0/33".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_network_normalizes_host_bits() {
        let host = cidr("10.0.1.17/24");
        assert_eq!(host.network(), cidr("10.0.1.0/24"));
    }

    #[test]
    fn test_contains_host_excludes_edges() {
        let net = cidr("10.0.1.0/24");
        assert!(net.contains_host(Ipv4Addr::new(10, 0, 1, 1)));
        assert!(net.contains_host(Ipv4Addr::new(10, 0, 1, 254)));
        assert!(!net.contains_host(Ipv4Addr::new(10, 0, 1, 0)));
        assert!(!net.contains_host(Ipv4Addr::new(10, 0, 1, 255)));
        assert!(!net.contains_host(Ipv4Addr::new(10, 0, 2, 1)));
    }

    #[test]
    fn test_nth_host_by_id() {
        let net = cidr("10.0.0.0/24");
        // node_id 1 takes host 0
        assert_eq!(net.nth_host(0).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(net.nth_host(4).unwrap(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(net.nth_host(254).is_err());
    }
}
