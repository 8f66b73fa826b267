//! CIDR arithmetic for subnet and service-IP allocation
//!
//! A small, pure library used by the cluster-spec normalizer and the options
//! loader. The parent network range is split into deterministic child ranges;
//! well-known service IPs are derived from the service cluster IP range.
//!
//! Arithmetic beyond parsing is IPv4-only; IPv6 ranges parse and display but
//! any attempt to subdivide them fails with
//! [`Error::UnsupportedAddressFamily`](crate::Error::UnsupportedAddressFamily).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An IP network range in CIDR notation
///
/// Stored in canonical form: the address is always the network address
/// (host bits zeroed).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cidr {
    ip: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Construct an IPv4 CIDR from a network address and prefix length
    pub fn v4(ip: Ipv4Addr, prefix: u8) -> Self {
        let masked = mask_v4(u32::from(ip), prefix);
        Self {
            ip: IpAddr::V4(Ipv4Addr::from(masked)),
            prefix,
        }
    }

    /// The network (base) address
    pub fn network(&self) -> IpAddr {
        self.ip
    }

    /// The prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// True if this is an IPv4 range
    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// Number of host bits in this range
    pub fn host_bits(&self) -> u8 {
        let total: u8 = match self.ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        total - self.prefix
    }

    /// The network address as a u32, for IPv4 ranges
    fn network_v4(&self) -> Result<u32> {
        match self.ip {
            IpAddr::V4(ip) => Ok(u32::from(ip)),
            IpAddr::V6(_) => Err(Error::UnsupportedAddressFamily(self.to_string())),
        }
    }

    /// True iff `ip` lies within this range
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.ip, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                mask_v4(u32::from(ip), self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                mask_v6(u128::from(ip), self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }

    /// True iff the two ranges are non-disjoint
    ///
    /// Two CIDRs overlap iff either contains the other's network address.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other.network()) || other.contains(self.network())
    }

    /// True iff `other` lies entirely within this range
    pub fn contains_cidr(&self, other: &Cidr) -> bool {
        self.prefix <= other.prefix && self.contains(other.network())
    }

    /// The sub-range with the prefix lengthened by `extra_bits` and the given
    /// index placed in the newly exposed bits
    ///
    /// `subdivide(0, 1)` is the lower half, `subdivide(1, 1)` the upper half.
    pub fn subdivide(&self, index: u32, extra_bits: u8) -> Result<Cidr> {
        let base = self.network_v4()?;
        let prefix = self.prefix + extra_bits;
        if prefix > 32 || index >= (1u32 << extra_bits) {
            return Err(Error::validation(
                self.to_string(),
                format!("cannot carve child {index} with {extra_bits} extra bits"),
            ));
        }
        let n = base + (index << (32 - prefix));
        Ok(Cidr::v4(Ipv4Addr::from(n), prefix))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ip_str, prefix_str) = s
            .split_once('/')
            .ok_or_else(|| Error::validation(s, "not in CIDR notation"))?;
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| Error::validation(s, "invalid IP address"))?;
        let prefix: u8 = prefix_str
            .parse()
            .map_err(|_| Error::validation(s, "invalid prefix length"))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(Error::validation(s, "prefix length out of range"));
        }
        let ip = match ip {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(mask_v4(u32::from(v4), prefix))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(mask_v6(u128::from(v6), prefix))),
        };
        Ok(Self { ip, prefix })
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn mask_v4(ip: u32, prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        ip & (u32::MAX << (32 - prefix))
    }
}

fn mask_v6(ip: u128, prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        ip & (u128::MAX << (128 - prefix))
    }
}

/// Split the parent range into 8 children with prefix length `parent + 3`,
/// numbered 0..7 in increasing address order
pub fn split_into_8_subnets(parent: &Cidr) -> Result<Vec<Cidr>> {
    if !parent.is_ipv4() {
        return Err(Error::UnsupportedAddressFamily(parent.to_string()));
    }
    (0..8).map(|i| parent.subdivide(i, 3)).collect()
}

/// The IP at `base + id` within the range, interpreted big-endian
///
/// Used for well-known service IPs (e.g. kube-dns). There is no modular
/// wrap: an `id` at or beyond the range's host capacity is an error.
pub fn well_known_service_ip(cidr: &Cidr, id: u32) -> Result<IpAddr> {
    let host_bits = cidr.host_bits();
    if host_bits < 32 && u64::from(id) >= (1u64 << host_bits) {
        return Err(Error::validation(
            cidr.to_string(),
            format!("service IP id {id} exceeds range capacity"),
        ));
    }
    match cidr.network() {
        IpAddr::V4(base) => Ok(IpAddr::V4(Ipv4Addr::from(u32::from(base) + id))),
        IpAddr::V6(base) => Ok(IpAddr::V6(Ipv6Addr::from(u128::from(base) + u128::from(id)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalizes_host_bits() {
        let cidr: Cidr = "172.20.1.5/16".parse().unwrap();
        assert_eq!(cidr.to_string(), "172.20.0.0/16");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-a-cidr".parse::<Cidr>().is_err());
        assert!("172.20.0.0".parse::<Cidr>().is_err());
        assert!("172.20.0.0/40".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_split_into_8_subnets() {
        let parent: Cidr = "172.20.0.0/16".parse().unwrap();
        let children = split_into_8_subnets(&parent).unwrap();

        let expected = [
            "172.20.0.0/19",
            "172.20.32.0/19",
            "172.20.64.0/19",
            "172.20.96.0/19",
            "172.20.128.0/19",
            "172.20.160.0/19",
            "172.20.192.0/19",
            "172.20.224.0/19",
        ];
        let actual: Vec<String> = children.iter().map(|c| c.to_string()).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_split_rejects_ipv6() {
        let parent: Cidr = "2001:db8::/32".parse().unwrap();
        let err = split_into_8_subnets(&parent).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAddressFamily(_)));
    }

    #[test]
    fn test_overlaps() {
        let a: Cidr = "172.20.0.0/16".parse().unwrap();
        let b: Cidr = "172.20.32.0/19".parse().unwrap();
        let c: Cidr = "10.0.0.0/8".parse().unwrap();

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_contains_cidr() {
        let net: Cidr = "172.20.0.0/16".parse().unwrap();
        let sub: Cidr = "172.20.64.0/19".parse().unwrap();
        assert!(net.contains_cidr(&sub));
        assert!(!sub.contains_cidr(&net));
    }

    #[test]
    fn test_subdivide_halves() {
        let nm: Cidr = "100.64.0.0/10".parse().unwrap();
        let upper = nm.subdivide(1, 1).unwrap();
        assert_eq!(upper.to_string(), "100.96.0.0/11");
        let lower_quarter = nm.subdivide(0, 3).unwrap();
        assert_eq!(lower_quarter.to_string(), "100.64.0.0/13");
    }

    #[test]
    fn test_well_known_service_ip_base() {
        let range: Cidr = "100.64.0.0/13".parse().unwrap();
        let base = well_known_service_ip(&range, 0).unwrap();
        assert_eq!(base, range.network());
    }

    #[test]
    fn test_well_known_service_ip_monotonic() {
        let range: Cidr = "100.64.0.0/13".parse().unwrap();
        let mut prev = well_known_service_ip(&range, 0).unwrap();
        for id in 1..20 {
            let next = well_known_service_ip(&range, id).unwrap();
            assert!(next > prev, "service IPs must be monotonic in id");
            prev = next;
        }
        assert_eq!(
            well_known_service_ip(&range, 10).unwrap().to_string(),
            "100.64.0.10"
        );
    }

    #[test]
    fn test_well_known_service_ip_no_wrap() {
        let range: Cidr = "10.0.0.0/30".parse().unwrap();
        assert!(well_known_service_ip(&range, 3).is_ok());
        assert!(well_known_service_ip(&range, 4).is_err());
    }

    #[test]
    fn test_well_known_service_ip_ipv6() {
        let range: Cidr = "fd00::/64".parse().unwrap();
        let ip = well_known_service_ip(&range, 10).unwrap();
        assert_eq!(ip.to_string(), "fd00::a");
    }

    #[test]
    fn test_serde_roundtrip() {
        let cidr: Cidr = "172.20.32.0/19".parse().unwrap();
        let json = serde_json::to_string(&cidr).unwrap();
        assert_eq!(json, "\"172.20.32.0/19\"");
        let parsed: Cidr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cidr);
    }
}
