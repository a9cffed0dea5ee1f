use std::net::Ipv4Addr;

use anyhow::bail;
use bytes::{BufMut, BytesMut};

pub const IPPROTO_UDP: u8 = 17;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// A parsed view of a raw IPv4 / UDP datagram as it is handed over by packet interception.
///  Only IPv4 is supported.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UdpDatagram<'a> {
    raw: &'a [u8],
    ip_header_len: usize,
    pub src_addr: Ipv4Addr,
    pub dest_addr: Ipv4Addr,
    pub src_port: u16,
    pub dest_port: u16,
}

impl <'a> UdpDatagram<'a> {
    pub fn parse(raw: &'a [u8]) -> anyhow::Result<UdpDatagram<'a>> {
        if raw.len() < IPV4_MIN_HEADER_LEN {
            bail!("packet of {} bytes is too short for an IP header", raw.len());
        }
        if raw[0] >> 4 != 4 {
            bail!("not an IPv4 packet");
        }

        let ip_header_len = ((raw[0] & 0x0f) as usize) * 4;
        if ip_header_len < IPV4_MIN_HEADER_LEN || raw.len() < ip_header_len + UDP_HEADER_LEN {
            bail!("packet of {} bytes is too short for IP header of {} bytes and UDP header", raw.len(), ip_header_len);
        }
        if raw[9] != IPPROTO_UDP {
            bail!("not a UDP packet: protocol {}", raw[9]);
        }

        let total_len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if total_len < ip_header_len + UDP_HEADER_LEN || total_len > raw.len() {
            bail!("inconsistent IP total length {} for a packet of {} bytes", total_len, raw.len());
        }
        let raw = &raw[..total_len];

        let udp = &raw[ip_header_len..];
        Ok(UdpDatagram {
            raw,
            ip_header_len,
            src_addr: Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]),
            dest_addr: Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]),
            src_port: u16::from_be_bytes([udp[0], udp[1]]),
            dest_port: u16::from_be_bytes([udp[2], udp[3]]),
        })
    }

    pub fn ip_header(&self) -> &'a [u8] {
        &self.raw[..self.ip_header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.raw[self.ip_header_len + UDP_HEADER_LEN..]
    }

    /// Builds a new datagram from this one, replacing the source address, both ports and the UDP
    ///  payload. Length fields and both checksums are recomputed; IP options are retained.
    pub fn rebuild(&self, src_addr: Ipv4Addr, src_port: u16, dest_port: u16, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let udp_len = UDP_HEADER_LEN + payload.len();
        let total_len = self.ip_header_len + udp_len;
        if total_len > u16::MAX as usize {
            bail!("rebuilt packet would have {} bytes", total_len);
        }

        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_slice(self.ip_header());
        buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        buf[10..12].copy_from_slice(&[0, 0]);
        buf[12..16].copy_from_slice(&src_addr.octets());
        let checksum = ip_checksum(&buf[..self.ip_header_len]);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());

        buf.put_u16(src_port);
        buf.put_u16(dest_port);
        buf.put_u16(udp_len as u16);
        buf.put_u16(0);
        buf.put_slice(payload);

        let checksum = udp_checksum(src_addr, self.dest_addr, &buf[self.ip_header_len..]);
        buf[self.ip_header_len + 6..self.ip_header_len + 8].copy_from_slice(&checksum.to_be_bytes());

        Ok(buf.to_vec())
    }
}

/// sum of all 16-bit big-endian words with end-around carry; an odd trailing byte is padded
///  with zero
fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// IPv4 header checksum. Computing it over a header with a zeroed checksum field yields the
///  value to insert; computing it over a header with a correct checksum yields 0.
pub fn ip_checksum(header: &[u8]) -> u16 {
    !fold(ones_complement_sum(header, 0))
}

/// UDP checksum over the IPv4 pseudo-header and the UDP segment (header + payload). A computed
///  value of 0 is transmitted as 0xFFFF since 0 means 'no checksum'.
pub fn udp_checksum(src_addr: Ipv4Addr, dest_addr: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo_header = [0u8; 12];
    pseudo_header[0..4].copy_from_slice(&src_addr.octets());
    pseudo_header[4..8].copy_from_slice(&dest_addr.octets());
    pseudo_header[9] = IPPROTO_UDP;
    pseudo_header[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = ones_complement_sum(&pseudo_header, 0);
    match !fold(ones_complement_sum(segment, sum)) {
        0 => 0xffff,
        checksum => checksum,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::test_util::packet::udp_packet;
    use super::*;

    #[test]
    fn test_ip_checksum_round_trip() {
        let mut header = udp_packet(Ipv4Addr::new(192, 168, 0, 1), 1234, Ipv4Addr::new(192, 168, 0, 199), 5000, b"abc")[..20].to_vec();
        header[10] = 0;
        header[11] = 0;

        let checksum = ip_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(ip_checksum(&header), 0);
    }

    #[test]
    fn test_ip_checksum_known_value() {
        // example header from RFC 1071 discussions / Wikipedia
        let header = b"\x45\x00\x00\x73\x00\x00\x40\x00\x40\x11\x00\x00\xc0\xa8\x00\x01\xc0\xa8\x00\xc7";
        assert_eq!(ip_checksum(header), 0xb861);
    }

    #[rstest]
    #[case::even(b"abcd".as_slice())]
    #[case::odd(b"abcde".as_slice())]
    #[case::empty(b"".as_slice())]
    fn test_udp_checksum_verifies(#[case] payload: &[u8]) {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);
        let packet = udp_packet(src, 4000, dest, 5000, payload);
        let segment = &packet[20..];

        // summing over a segment with a correct checksum yields 0xffff before complement
        assert_eq!(fold(ones_complement_sum(segment, ones_complement_sum(&[10, 0, 0, 1, 10, 0, 0, 2, 0, 17, 0, segment.len() as u8], 0))), 0xffff);
    }

    #[test]
    fn test_parse() {
        let packet = udp_packet(Ipv4Addr::new(10, 0, 0, 1), 4000, Ipv4Addr::new(10, 0, 0, 2), 5000, b"hello");
        let datagram = UdpDatagram::parse(&packet).unwrap();

        assert_eq!(datagram.src_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(datagram.dest_addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(datagram.src_port, 4000);
        assert_eq!(datagram.dest_port, 5000);
        assert_eq!(datagram.payload(), b"hello");
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut packet = udp_packet(Ipv4Addr::new(10, 0, 0, 1), 4000, Ipv4Addr::new(10, 0, 0, 2), 5000, b"hello");
        packet.extend_from_slice(b"junk");
        assert_eq!(UdpDatagram::parse(&packet).unwrap().payload(), b"hello");
    }

    #[rstest]
    #[case::too_short(|p: &mut Vec<u8>| p.truncate(19))]
    #[case::ipv6(|p: &mut Vec<u8>| p[0] = 0x65)]
    #[case::tcp(|p: &mut Vec<u8>| p[9] = 6)]
    #[case::total_len_too_big(|p: &mut Vec<u8>| p[3] = 0xff)]
    #[case::header_len_too_small(|p: &mut Vec<u8>| p[0] = 0x44)]
    fn test_parse_invalid(#[case] corrupt: fn(&mut Vec<u8>)) {
        let mut packet = udp_packet(Ipv4Addr::new(10, 0, 0, 1), 4000, Ipv4Addr::new(10, 0, 0, 2), 5000, b"hello");
        corrupt(&mut packet);
        assert!(UdpDatagram::parse(&packet).is_err());
    }

    #[test]
    fn test_rebuild() {
        let packet = udp_packet(Ipv4Addr::new(10, 1, 0, 1), 4000, Ipv4Addr::new(10, 0, 0, 2), 1001, b"HEADERpayload");
        let datagram = UdpDatagram::parse(&packet).unwrap();

        let rebuilt = datagram.rebuild(Ipv4Addr::new(10, 0, 0, 1), 4100, 5000, &datagram.payload()[6..]).unwrap();
        let parsed = UdpDatagram::parse(&rebuilt).unwrap();

        assert_eq!(rebuilt.len(), 20 + 8 + 7);
        assert_eq!(parsed.src_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.dest_addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parsed.src_port, 4100);
        assert_eq!(parsed.dest_port, 5000);
        assert_eq!(parsed.payload(), b"payload");

        assert_eq!(ip_checksum(parsed.ip_header()), 0);
        assert_eq!(&rebuilt[24..26], &[0, 15]);
        assert_eq!(udp_checksum(parsed.src_addr, parsed.dest_addr, &rebuilt[20..]), 0xffff);
    }
}
