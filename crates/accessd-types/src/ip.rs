//! IP prefix type with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IP network prefix (address plus prefix length).
///
/// A bare address parses as a host prefix (/32 or /128). The address bits
/// beyond the prefix length are preserved as given; matching logic that
/// needs the network address can mask as required.
///
/// # Examples
///
/// ```
/// use accessd_types::IpPrefix;
///
/// let p: IpPrefix = "10.1.0.0/16".parse().unwrap();
/// assert_eq!(p.prefix_len(), 16);
///
/// let host: IpPrefix = "10.1.2.3".parse().unwrap();
/// assert_eq!(host.prefix_len(), 32);
/// assert!(host.is_host());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new prefix, validating the length against the family.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max = Self::max_len(&addr);
        if prefix_len > max {
            return Err(ParseError::InvalidPrefixLength {
                len: prefix_len,
                family: if addr.is_ipv4() { "IPv4" } else { "IPv6" },
            });
        }
        Ok(IpPrefix { addr, prefix_len })
    }

    /// Creates a host prefix (/32 or /128) for an address.
    pub fn host(addr: IpAddr) -> Self {
        IpPrefix {
            prefix_len: Self::max_len(&addr),
            addr,
        }
    }

    fn max_len(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Returns the prefix address as given.
    pub const fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true for IPv4 prefixes.
    pub const fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Returns true for IPv6 prefixes.
    pub const fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Returns true if this is a full-length host prefix.
    pub fn is_host(&self) -> bool {
        self.prefix_len == Self::max_len(&self.addr)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((addr_str, len_str)) => {
                let addr: IpAddr = addr_str
                    .parse()
                    .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
                let len: u8 = len_str
                    .parse()
                    .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
                IpPrefix::new(addr, len)
            }
            None => {
                let addr: IpAddr = s
                    .parse()
                    .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))?;
                Ok(IpPrefix::host(addr))
            }
        }
    }
}

impl From<IpAddr> for IpPrefix {
    fn from(addr: IpAddr) -> Self {
        IpPrefix::host(addr)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(p: IpPrefix) -> String {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_cidr() {
        let p: IpPrefix = "10.1.0.0/16".parse().unwrap();
        assert_eq!(p.addr(), "10.1.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(p.prefix_len(), 16);
        assert!(p.is_ipv4());
        assert!(!p.is_host());
    }

    #[test]
    fn test_parse_bare_address() {
        let p: IpPrefix = "192.168.1.5".parse().unwrap();
        assert_eq!(p.prefix_len(), 32);
        assert!(p.is_host());

        let p6: IpPrefix = "fd00::1".parse().unwrap();
        assert_eq!(p6.prefix_len(), 128);
        assert!(p6.is_ipv6());
    }

    #[test]
    fn test_parse_invalid() {
        assert!("not-an-ip".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("fd00::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/x".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_v6_prefix_length() {
        let p: IpPrefix = "fd00::/64".parse().unwrap();
        assert_eq!(p.prefix_len(), 64);
        assert!(IpPrefix::new("fd00::1".parse().unwrap(), 128).is_ok());
    }

    #[test]
    fn test_display_round_trip() {
        let p: IpPrefix = "10.20.30.0/24".parse().unwrap();
        assert_eq!(p.to_string(), "10.20.30.0/24");
        assert_eq!(p.to_string().parse::<IpPrefix>().unwrap(), p);
    }

    #[test]
    fn test_host_from_addr() {
        let addr: IpAddr = "172.16.0.1".parse().unwrap();
        let p = IpPrefix::from(addr);
        assert!(p.is_host());
        assert_eq!(p.addr(), addr);
    }
}
