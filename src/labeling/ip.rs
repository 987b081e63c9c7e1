use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FlowspecError;
use crate::labeling::{Labeling, Spec};

/// An IPv4 prefix in canonical form: host bits below the prefix length are
/// always zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ipv4Prefix {
    addr: u32,
    prefixlen: u8,
}

impl Ipv4Prefix {
    pub fn new(addr: u32, prefixlen: u8) -> Self {
        assert!(prefixlen <= 32, "prefix length out of range");
        Self {
            addr: addr & Self::netmask(prefixlen),
            prefixlen,
        }
    }

    /// A single-address `/32` prefix.
    pub fn host(addr: u32) -> Self {
        Self::new(addr, 32)
    }

    pub fn prefixlen(&self) -> u8 {
        self.prefixlen
    }

    /// First address of the covered range.
    pub fn first(&self) -> u32 {
        self.addr
    }

    /// Last address of the covered range.
    pub fn last(&self) -> u32 {
        self.addr | !Self::netmask(self.prefixlen)
    }

    /// Number of addresses covered.
    pub fn size(&self) -> f64 {
        (1u64 << (32 - self.prefixlen)) as f64
    }

    pub fn contains(&self, other: &Ipv4Prefix) -> bool {
        self.first() <= other.first() && other.last() <= self.last()
    }

    fn netmask(prefixlen: u8) -> u32 {
        if prefixlen == 0 {
            0
        } else {
            u32::MAX << (32 - prefixlen)
        }
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.addr.to_be_bytes();
        write!(f, "{}.{}.{}.{}/{}", a, b, c, d, self.prefixlen)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = FlowspecError;

    /// Parses `a.b.c.d` (an implicit `/32`) or `a.b.c.d/len`.
    fn from_str(s: &str) -> Result<Self, FlowspecError> {
        let bad = || FlowspecError::BadPrefix { text: s.to_string() };

        let (quad, len) = match s.split_once('/') {
            Some((quad, len)) => (quad, len.parse::<u8>().map_err(|_| bad())?),
            None => (s, 32),
        };
        if len > 32 {
            return Err(bad());
        }

        let mut addr: u32 = 0;
        let mut octets = 0;
        for part in quad.split('.') {
            let octet = part.parse::<u8>().map_err(|_| bad())?;
            addr = (addr << 8) | u32::from(octet);
            octets += 1;
        }
        if octets != 4 {
            return Err(bad());
        }

        Ok(Ipv4Prefix::new(addr, len))
    }
}

/// The IPv4 prefix lattice.
///
/// `join` is the shortest prefix covering both input ranges; the cost of a
/// prefix is the number of addresses it covers, `2^(32 − prefixlen)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ipv4PrefixLabeling;

impl Labeling for Ipv4PrefixLabeling {
    type Value = Ipv4Prefix;

    fn join(&self, a: &Ipv4Prefix, b: &Ipv4Prefix) -> Spec<Ipv4Prefix> {
        let start = a.first().min(b.first());
        let end = a.last().max(b.last());

        // the first differing bit between range ends bounds the prefix length
        let prefixlen = (start ^ end).leading_zeros() as u8;
        let joined = Ipv4Prefix::new(start, prefixlen);
        Spec::new(joined.size(), joined)
    }

    fn meet(&self, a: &Ipv4Prefix, b: &Ipv4Prefix) -> Option<Spec<Ipv4Prefix>> {
        // prefixes overlap only by containment
        if b.contains(a) {
            Some(Spec::new(a.size(), *a))
        } else if a.contains(b) {
            Some(Spec::new(b.size(), *b))
        } else {
            None
        }
    }

    fn subset(&self, a: &Ipv4Prefix, b: &Ipv4Prefix) -> bool {
        b.contains(a)
    }

    fn cost(&self, v: &Ipv4Prefix) -> f64 {
        v.size()
    }

    fn top(&self) -> Ipv4Prefix {
        Ipv4Prefix::new(0, 0)
    }

    fn render(&self, v: &Ipv4Prefix) -> String {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Ipv4Prefix {
        s.parse().unwrap()
    }

    #[test]
    fn join_of_equal_hosts_is_identity() {
        let labeling = Ipv4PrefixLabeling;
        assert_eq!(
            labeling.join(&p("192.168.1.0/32"), &p("192.168.1.0/32")),
            Spec::new(1.0, p("192.168.1.0/32"))
        );
    }

    #[test]
    fn join_of_adjacent_hosts_is_a_31() {
        let labeling = Ipv4PrefixLabeling;
        assert_eq!(
            labeling.join(&p("192.168.1.0/32"), &p("192.168.1.1/32")),
            Spec::new(2.0, p("192.168.1.0/31"))
        );
    }

    #[test]
    fn join_of_distant_hosts_is_the_default_route() {
        let labeling = Ipv4PrefixLabeling;
        assert_eq!(
            labeling.join(&p("192.168.1.0/32"), &p("0.168.1.1/32")),
            Spec::new(2f64.powi(32), p("0.0.0.0/0"))
        );
    }

    #[test]
    fn subset_and_meet_follow_containment() {
        let labeling = Ipv4PrefixLabeling;
        assert!(labeling.subset(&p("10.0.0.1/32"), &p("10.0.0.0/24")));
        assert!(!labeling.subset(&p("10.0.0.0/24"), &p("10.0.0.1/32")));
        assert!(labeling.subset(&p("10.0.0.0/24"), &labeling.top()));

        assert_eq!(
            labeling.meet(&p("10.0.0.0/24"), &p("10.0.0.1/32")),
            Some(Spec::new(1.0, p("10.0.0.1/32")))
        );
        assert_eq!(labeling.meet(&p("10.0.0.0/24"), &p("10.0.1.0/24")), None);
    }

    #[test]
    fn parse_and_display_round_trip() {
        assert_eq!(p("10.1.2.3").to_string(), "10.1.2.3/32");
        assert_eq!(p("10.1.2.3/8").to_string(), "10.0.0.0/8");
        assert!("10.1.2".parse::<Ipv4Prefix>().is_err());
        assert!("10.1.2.3/33".parse::<Ipv4Prefix>().is_err());
        assert!("10.1.2.256/8".parse::<Ipv4Prefix>().is_err());
    }
}
