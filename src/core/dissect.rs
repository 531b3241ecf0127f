//! Raw frame dissection.
//!
//! Borrowing views over a captured byte buffer: Ethernet, then IPv4, then
//! TCP or UDP. Each view is plain offset arithmetic over the original
//! buffer; nothing is copied and no checksum is validated.
//!
//! A frame that is not IPv4, or an IP protocol other than TCP/UDP, is
//! "not applicable" rather than an error. A buffer too short for the layer
//! being read is a [`DissectError::Truncated`] — recoverable, the capture
//! loop logs it and moves on.

use std::net::Ipv4Addr;

use thiserror::Error;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// Ethernet header length.
pub const ETHERNET_HEADER_LEN: usize = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DissectError {
    #[error("truncated packet at {context}: need {needed} bytes, have {have}")]
    Truncated {
        context: &'static str,
        needed: usize,
        have: usize,
    },
}

fn need(data: &[u8], needed: usize, context: &'static str) -> Result<(), DissectError> {
    if data.len() < needed {
        Err(DissectError::Truncated {
            context,
            needed,
            have: data.len(),
        })
    } else {
        Ok(())
    }
}

/// Ethernet II header view.
#[derive(Debug)]
pub struct EthernetView<'a> {
    data: &'a [u8],
}

impl<'a> EthernetView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, DissectError> {
        need(data, ETHERNET_HEADER_LEN, "ethernet header")?;
        Ok(Self { data })
    }

    /// EtherType field, big endian at bytes 12..14.
    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn payload_offset(&self) -> usize {
        ETHERNET_HEADER_LEN
    }
}

/// IPv4 header view, positioned after the Ethernet header.
#[derive(Debug)]
pub struct Ipv4View<'a> {
    data: &'a [u8],
    header_offset: usize,
}

impl<'a> Ipv4View<'a> {
    pub fn parse(eth: &EthernetView<'a>) -> Result<Self, DissectError> {
        let header_offset = eth.payload_offset();
        need(eth.data, header_offset + 20, "ipv4 header")?;
        let view = Self {
            data: eth.data,
            header_offset,
        };
        // Options may push the header past the minimum 20 bytes.
        need(eth.data, view.payload_offset(), "ipv4 options")?;
        Ok(view)
    }

    /// IP protocol number (byte 9 of the header).
    pub fn protocol(&self) -> u8 {
        self.data[self.header_offset + 9]
    }

    /// Source address, network byte order on the wire.
    pub fn source(&self) -> Ipv4Addr {
        let o = self.header_offset + 12;
        Ipv4Addr::new(self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3])
    }

    /// Destination address, network byte order on the wire.
    pub fn destination(&self) -> Ipv4Addr {
        let o = self.header_offset + 16;
        Ipv4Addr::new(self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3])
    }

    /// Total length field: the whole IP datagram, header included.
    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes([self.data[self.header_offset + 2], self.data[self.header_offset + 3]])
    }

    /// Header length derived from the low 4 bits of the first byte (IHL × 4).
    pub fn header_len(&self) -> usize {
        ((self.data[self.header_offset] & 0x0f) as usize) << 2
    }

    /// Offset of the transport header within the frame buffer.
    pub fn payload_offset(&self) -> usize {
        self.header_offset + self.header_len()
    }

    /// Transport-layer length: total length minus the IP header.
    pub fn payload_len(&self) -> usize {
        (self.total_len() as usize).saturating_sub(self.header_len())
    }
}

/// TCP header view.
#[derive(Debug)]
pub struct TcpView<'a> {
    data: &'a [u8],
    header_offset: usize,
    payload_len: usize,
}

impl<'a> TcpView<'a> {
    pub fn parse(ip: &Ipv4View<'a>) -> Result<Self, DissectError> {
        let header_offset = ip.payload_offset();
        need(ip.data, header_offset + 20, "tcp header")?;
        let mut view = Self {
            data: ip.data,
            header_offset,
            payload_len: 0,
        };
        view.payload_len = ip.payload_len().saturating_sub(view.header_len());
        Ok(view)
    }

    pub fn source_port(&self) -> u16 {
        u16::from_be_bytes([self.data[self.header_offset], self.data[self.header_offset + 1]])
    }

    pub fn destination_port(&self) -> u16 {
        u16::from_be_bytes([self.data[self.header_offset + 2], self.data[self.header_offset + 3]])
    }

    /// Flag bits (FIN through URG) from byte 13.
    pub fn flags(&self) -> u8 {
        self.data[self.header_offset + 13] & 0x3f
    }

    /// Header length from the high nibble of byte 12 (data offset × 4).
    pub fn header_len(&self) -> usize {
        ((self.data[self.header_offset + 12] & 0xf0) as usize) >> 2
    }

    /// TCP payload length derived from the IP total length.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

/// UDP header view.
///
/// UDP runt frames are the classic truncation case, so every field read is
/// preceded by its own bound check.
#[derive(Debug)]
pub struct UdpView {
    source_port: u16,
    destination_port: u16,
    payload_len: usize,
}

impl UdpView {
    pub fn parse(ip: &Ipv4View<'_>) -> Result<Self, DissectError> {
        let data = ip.data;
        let o = ip.payload_offset();
        need(data, o + 2, "udp source port")?;
        let source_port = u16::from_be_bytes([data[o], data[o + 1]]);
        need(data, o + 4, "udp destination port")?;
        let destination_port = u16::from_be_bytes([data[o + 2], data[o + 3]]);
        Ok(Self {
            source_port,
            destination_port,
            payload_len: ip.payload_len().saturating_sub(8),
        })
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    pub fn destination_port(&self) -> u16 {
        self.destination_port
    }

    /// Datagram payload length derived from the IP total length.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
}

/// Outcome of dissecting one frame down to the transport layer.
#[derive(Debug)]
pub enum Dissected<'a> {
    Tcp { ip: Ipv4View<'a>, tcp: TcpView<'a> },
    Udp { ip: Ipv4View<'a>, udp: UdpView },
    /// Non-IPv4 frame, or an IP protocol the accountant does not track
    /// (ICMP, GRE, anything else). Skipped without error.
    NotApplicable,
}

/// Dissect a raw frame buffer.
pub fn dissect(data: &[u8]) -> Result<Dissected<'_>, DissectError> {
    let eth = EthernetView::parse(data)?;
    if eth.ethertype() != ETHERTYPE_IPV4 {
        return Ok(Dissected::NotApplicable);
    }
    let ip = Ipv4View::parse(&eth)?;
    match ip.protocol() {
        6 => {
            let tcp = TcpView::parse(&ip)?;
            Ok(Dissected::Tcp { ip, tcp })
        }
        17 => {
            let udp = UdpView::parse(&ip)?;
            Ok(Dissected::Udp { ip, udp })
        }
        _ => Ok(Dissected::NotApplicable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ethernet + IPv4 + TCP frame with the given addressing and an empty
    /// TCP payload. `ip_total_len` is written into the IP header verbatim.
    fn tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, ip_total_len: u16) -> Vec<u8> {
        let mut f = vec![0u8; 14 + 20 + 20];
        f[12] = 0x08; // EtherType IPv4
        f[13] = 0x00;
        f[14] = 0x45; // version 4, IHL 5
        f[16..18].copy_from_slice(&ip_total_len.to_be_bytes());
        f[23] = 6; // protocol TCP
        f[26..30].copy_from_slice(&src);
        f[30..34].copy_from_slice(&dst);
        f[34..36].copy_from_slice(&sport.to_be_bytes());
        f[36..38].copy_from_slice(&dport.to_be_bytes());
        f[46] = 0x50; // data offset 5
        f[47] = 0x02; // SYN
        f
    }

    fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
        let mut f = vec![0u8; 14 + 20 + 8];
        f[12] = 0x08;
        f[13] = 0x00;
        f[14] = 0x45;
        f[16..18].copy_from_slice(&28u16.to_be_bytes());
        f[23] = 17; // protocol UDP
        f[26..30].copy_from_slice(&src);
        f[30..34].copy_from_slice(&dst);
        f[34..36].copy_from_slice(&sport.to_be_bytes());
        f[36..38].copy_from_slice(&dport.to_be_bytes());
        f
    }

    #[test]
    fn test_tcp_dissection() {
        let frame = tcp_frame([10, 0, 0, 5], 3389, [10, 0, 0, 9], 51000, 40);
        match dissect(&frame).unwrap() {
            Dissected::Tcp { ip, tcp } => {
                assert_eq!(ip.source(), std::net::Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(ip.destination(), std::net::Ipv4Addr::new(10, 0, 0, 9));
                assert_eq!(ip.total_len(), 40);
                assert_eq!(ip.header_len(), 20);
                assert_eq!(tcp.source_port(), 3389);
                assert_eq!(tcp.destination_port(), 51000);
                assert_eq!(tcp.flags(), 0x02);
                assert_eq!(tcp.header_len(), 20);
                assert_eq!(tcp.payload_len(), 0);
            }
            _ => panic!("expected TCP"),
        }
    }

    #[test]
    fn test_udp_dissection() {
        let frame = udp_frame([192, 168, 1, 10], 53124, [8, 8, 8, 8], 53);
        match dissect(&frame).unwrap() {
            Dissected::Udp { ip, udp } => {
                assert_eq!(ip.protocol(), 17);
                assert_eq!(udp.source_port(), 53124);
                assert_eq!(udp.destination_port(), 53);
                assert_eq!(udp.payload_len(), 0);
            }
            _ => panic!("expected UDP"),
        }
    }

    #[test]
    fn test_non_ip_is_not_applicable() {
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        assert!(matches!(dissect(&frame).unwrap(), Dissected::NotApplicable));
    }

    #[test]
    fn test_icmp_is_not_applicable() {
        let mut frame = tcp_frame([1, 1, 1, 1], 0, [2, 2, 2, 2], 0, 40);
        frame[23] = 1; // ICMP
        assert!(matches!(dissect(&frame).unwrap(), Dissected::NotApplicable));
    }

    #[test]
    fn test_truncated_udp() {
        let mut frame = udp_frame([1, 1, 1, 1], 100, [2, 2, 2, 2], 200);
        frame.truncate(14 + 20 + 3); // cuts the destination port in half
        let err = dissect(&frame).unwrap_err();
        assert!(matches!(
            err,
            DissectError::Truncated {
                context: "udp destination port",
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_ethernet() {
        let frame = [0u8; 6];
        assert!(dissect(&frame).is_err());
    }

    #[test]
    fn test_ip_options_shift_transport_offset() {
        // IHL 6 => 24-byte IP header, TCP starts 4 bytes later.
        let mut f = vec![0u8; 14 + 24 + 20];
        f[12] = 0x08;
        f[13] = 0x00;
        f[14] = 0x46; // version 4, IHL 6
        f[16..18].copy_from_slice(&44u16.to_be_bytes());
        f[23] = 6;
        f[38..40].copy_from_slice(&80u16.to_be_bytes()); // source port at 14+24
        f[50] = 0x50;
        match dissect(&f).unwrap() {
            Dissected::Tcp { ip, tcp } => {
                assert_eq!(ip.header_len(), 24);
                assert_eq!(tcp.source_port(), 80);
            }
            _ => panic!("expected TCP"),
        }
    }
}
