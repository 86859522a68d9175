//! Ancillary (control) message data captured alongside a received datagram:
//! the local address the kernel delivered the packet to (`IP_PKTINFO` /
//! `IPV6_PKTINFO`) and, where available, a kernel receive timestamp.
//!
//! Captured so a reply can be sent from the same local address the peer
//! targeted, which matters on multi-homed hosts and for best-effort NAT
//! traversal.

use std::net::{Ipv4Addr, Ipv6Addr};

/// The local-address ancillary data for one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pktinfo {
    /// No ancillary data was captured (the kernel didn't provide it, or the
    /// option wasn't enabled on the socket).
    Empty,
    V4 {
        local_addr: Ipv4Addr,
        if_index: u32,
    },
    V6 {
        local_addr: Ipv6Addr,
        if_index: u32,
    },
}

impl Default for Pktinfo {
    fn default() -> Self {
        Pktinfo::Empty
    }
}

impl Pktinfo {
    pub fn is_full(&self) -> bool {
        !matches!(self, Pktinfo::Empty)
    }

    pub fn clear(&mut self) {
        *self = Pktinfo::Empty;
    }

    /// An independently-owned copy. `Pktinfo` is a plain value type (no heap
    /// data), so this is just `Copy`; kept as a named method for parity with
    /// `spud_pktinfo_dup`, whose callers expect a value they can destroy
    /// without affecting the original.
    pub fn duplicate(&self) -> Self {
        *self
    }

    /// Recover a `SocketAddr` carrying this pktinfo's local address, with
    /// `port` filled in by the caller (the ancillary data never carries a
    /// port). Returns `None` if empty.
    pub fn extract_sockaddr(&self, port: u16) -> Option<std::net::SocketAddr> {
        match self {
            Pktinfo::Empty => None,
            Pktinfo::V4 { local_addr, .. } => {
                Some(std::net::SocketAddr::new(std::net::IpAddr::V4(*local_addr), port))
            }
            Pktinfo::V6 { local_addr, .. } => {
                Some(std::net::SocketAddr::new(std::net::IpAddr::V6(*local_addr), port))
            }
        }
    }

    pub fn set_v4(&mut self, local_addr: Ipv4Addr, if_index: u32) {
        *self = Pktinfo::V4 {
            local_addr,
            if_index,
        };
    }

    pub fn set_v6(&mut self, local_addr: Ipv6Addr, if_index: u32) {
        *self = Pktinfo::V6 {
            local_addr,
            if_index,
        };
    }

    /// Build the raw `in_pktinfo` the kernel expects in an outgoing
    /// `IP_PKTINFO` control message, if this holds v4 info.
    pub fn to_in_pktinfo(&self) -> Option<libc::in_pktinfo> {
        match self {
            Pktinfo::V4 {
                local_addr,
                if_index,
            } => Some(libc::in_pktinfo {
                ipi_ifindex: *if_index as i32,
                ipi_spec_dst: libc::in_addr {
                    s_addr: u32::from_ne_bytes(local_addr.octets()),
                },
                ipi_addr: libc::in_addr { s_addr: 0 },
            }),
            _ => None,
        }
    }

    /// Build the raw `in6_pktinfo` the kernel expects in an outgoing
    /// `IPV6_PKTINFO` control message, if this holds v6 info.
    pub fn to_in6_pktinfo(&self) -> Option<libc::in6_pktinfo> {
        match self {
            Pktinfo::V6 {
                local_addr,
                if_index,
            } => Some(libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: local_addr.octets(),
                },
                ipi6_ifindex: *if_index,
            }),
            _ => None,
        }
    }

    /// Parse an `in_pktinfo` as delivered in a received `IP_PKTINFO`
    /// ancillary message.
    pub fn from_in_pktinfo(info: &libc::in_pktinfo) -> Self {
        Pktinfo::V4 {
            local_addr: Ipv4Addr::from(info.ipi_addr.s_addr.to_ne_bytes()),
            if_index: info.ipi_ifindex as u32,
        }
    }

    /// Parse an `in6_pktinfo` as delivered in a received `IPV6_PKTINFO`
    /// ancillary message.
    pub fn from_in6_pktinfo(info: &libc::in6_pktinfo) -> Self {
        Pktinfo::V6 {
            local_addr: Ipv6Addr::from(info.ipi6_addr.s6_addr),
            if_index: info.ipi6_ifindex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        assert_eq!(Pktinfo::default(), Pktinfo::Empty);
        assert!(!Pktinfo::Empty.is_full());
    }

    #[test]
    fn v4_round_trips_through_raw_struct() {
        let mut info = Pktinfo::Empty;
        info.set_v4(Ipv4Addr::new(192, 168, 1, 2), 3);
        assert!(info.is_full());

        let raw = info.to_in_pktinfo().unwrap();
        assert_eq!(raw.ipi_ifindex, 3);
    }

    #[test]
    fn v6_round_trips_through_raw_struct() {
        let mut info = Pktinfo::Empty;
        let addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        info.set_v6(addr, 7);

        let raw = info.to_in6_pktinfo().unwrap();
        let parsed = Pktinfo::from_in6_pktinfo(&raw);
        assert_eq!(parsed, Pktinfo::V6 {
            local_addr: addr,
            if_index: 7,
        });
    }

    #[test]
    fn duplicate_is_independent_value() {
        let mut info = Pktinfo::Empty;
        info.set_v4(Ipv4Addr::new(10, 0, 0, 1), 2);
        let dup = info.duplicate();
        info.clear();
        assert_eq!(dup, Pktinfo::V4 { local_addr: Ipv4Addr::new(10, 0, 0, 1), if_index: 2 });
    }

    #[test]
    fn extract_sockaddr_fills_in_given_port() {
        let mut info = Pktinfo::Empty;
        assert!(info.extract_sockaddr(1234).is_none());
        info.set_v4(Ipv4Addr::new(10, 0, 0, 1), 2);
        assert_eq!(
            info.extract_sockaddr(1234),
            Some("10.0.0.1:1234".parse().unwrap())
        );
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut info = Pktinfo::Empty;
        info.set_v4(Ipv4Addr::LOCALHOST, 1);
        info.clear();
        assert_eq!(info, Pktinfo::Empty);
    }
}
