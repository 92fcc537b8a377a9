//! Network-layer flow identity
//!
//! A flow is the unordered pair of network endpoints. Its hash drives shard
//! selection, so it must be symmetric: both legs of an exchange have to land
//! on the same shard for TCP reassembly and correlation to work.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Pair of network-layer endpoints as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl NetFlow {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }

    /// Endpoints ordered smaller-first, identical for both directions.
    pub fn normalized(&self) -> (IpAddr, IpAddr) {
        if self.src <= self.dst {
            (self.src, self.dst)
        } else {
            (self.dst, self.src)
        }
    }

    /// Symmetric 64-bit flow hash over the normalized endpoint pair.
    pub fn fast_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.normalized().hash(&mut hasher);
        hasher.finish()
    }

    /// Shard index for a pool of `mask + 1` shards, where `mask + 1` is a
    /// power of two.
    pub fn shard(&self, mask: usize) -> usize {
        (self.fast_hash() as usize) & mask
    }

    /// The same flow seen from the other side.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl std::fmt::Display for NetFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_hash_symmetry_v4() {
        let a = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100));
        let b = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(NetFlow::new(a, b).fast_hash(), NetFlow::new(b, a).fast_hash());
    }

    #[test]
    fn test_hash_symmetry_v6() {
        let a = IpAddr::V6("2001:db8::1".parse::<Ipv6Addr>().unwrap());
        let b = IpAddr::V6("2001:4860:4860::8888".parse::<Ipv6Addr>().unwrap());
        let flow = NetFlow::new(a, b);
        assert_eq!(flow.fast_hash(), flow.reversed().fast_hash());
    }

    #[test]
    fn test_distinct_flows_differ() {
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let c = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
        assert_ne!(NetFlow::new(a, b).fast_hash(), NetFlow::new(a, c).fast_hash());
    }

    #[test]
    fn test_shard_mask() {
        let flow = NetFlow::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        );
        let mask = 7;
        assert_eq!(flow.shard(mask), (flow.fast_hash() as usize) & mask);
        assert!(flow.shard(mask) < 8);
        assert_eq!(flow.shard(mask), flow.reversed().shard(mask));
    }
}
