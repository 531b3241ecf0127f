//! Flow identity and accounting records.
//!
//! A flow is one direction of a conversation: the 5-tuple is taken exactly
//! as it appears in the packet headers, so a request and its reply are two
//! distinct flows. Downstream log consumers rely on getting two rows per
//! conversation.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::dissect::{Ipv4View, TcpView, UdpView};

/// Capture-clock time in 100 ns ticks since the Unix epoch.
///
/// Monotonic within one capture session; only ordering and deltas of this
/// clock drive expiry. Wall-clock time is used solely to name log files.
pub type Ticks = i64;

/// Number of 100 ns ticks per second.
pub const TICKS_PER_SECOND: Ticks = 10_000_000;

/// IP protocol numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Gre,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            47 => IpProtocol::Gre,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Gre => 47,
            IpProtocol::Other(v) => v,
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Gre => write!(f, "GRE"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// Directional flow identity.
///
/// Equality and hashing cover all five fields; there is deliberately no
/// endpoint normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub protocol: IpProtocol,
}

impl FlowKey {
    /// Build a key from a dissected IPv4 + TCP header pair.
    pub fn from_tcp(ip: &Ipv4View<'_>, tcp: &TcpView<'_>) -> Self {
        Self {
            src_addr: ip.source(),
            src_port: tcp.source_port(),
            dst_addr: ip.destination(),
            dst_port: tcp.destination_port(),
            protocol: IpProtocol::Tcp,
        }
    }

    /// Build a key from a dissected IPv4 + UDP header pair.
    pub fn from_udp(ip: &Ipv4View<'_>, udp: &UdpView) -> Self {
        Self {
            src_addr: ip.source(),
            src_port: udp.source_port(),
            dst_addr: ip.destination(),
            dst_port: udp.destination_port(),
            protocol: IpProtocol::Udp,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}:{} -> {}:{}",
            self.protocol, self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

/// Mutable accounting record for one flow.
///
/// Owned exclusively by the flow table from creation until flush; it is
/// handed out by value at flush time and destroyed with the table entry.
#[derive(Debug, Clone)]
pub struct FlowStats {
    pub key: FlowKey,
    /// Capture timestamp of the first packet.
    pub first_seen: Ticks,
    /// Capture timestamp of the most recent packet.
    pub last_seen: Ticks,
    pub packets: u64,
    /// Bytes at the IP layer, header included.
    pub bytes: u64,
}

impl FlowStats {
    /// New record for a flow first observed at `packet_time`; counters start
    /// at zero and the caller accounts the first packet itself.
    pub fn new(key: FlowKey, packet_time: Ticks) -> Self {
        Self {
            key,
            first_seen: packet_time,
            last_seen: packet_time,
            packets: 0,
            bytes: 0,
        }
    }

    /// Flow duration in whole milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.last_seen - self.first_seen) / (TICKS_PER_SECOND / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> FlowKey {
        FlowKey {
            src_addr: Ipv4Addr::from(src),
            src_port: sport,
            dst_addr: Ipv4Addr::from(dst),
            dst_port: dport,
            protocol: IpProtocol::Tcp,
        }
    }

    #[test]
    fn test_key_directional() {
        let forward = key([10, 0, 0, 5], 3389, [10, 0, 0, 9], 51000);
        let reverse = key([10, 0, 0, 9], 51000, [10, 0, 0, 5], 3389);
        assert_ne!(forward, reverse);
        assert_eq!(forward, key([10, 0, 0, 5], 3389, [10, 0, 0, 9], 51000));
    }

    #[test]
    fn test_protocol_roundtrip() {
        assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
        assert_eq!(u8::from(IpProtocol::Udp), 17);
        assert_eq!(IpProtocol::from(132), IpProtocol::Other(132));
        assert_eq!(u8::from(IpProtocol::Other(132)), 132);
    }

    #[test]
    fn test_duration_ms() {
        let mut stats = FlowStats::new(key([1, 1, 1, 1], 1, [2, 2, 2, 2], 2), 0);
        stats.last_seen = 1_000_000; // 100 ms in ticks
        assert_eq!(stats.duration_ms(), 100);
    }

    #[test]
    fn test_key_display() {
        let k = key([10, 0, 0, 5], 3389, [10, 0, 0, 9], 51000);
        assert_eq!(k.to_string(), "TCP: 10.0.0.5:3389 -> 10.0.0.9:51000");
    }
}
