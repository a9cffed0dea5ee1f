use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use crate::flow_id::FlowIdentity;
use crate::host::Ind;
use crate::wire::ip_packet::{ip_checksum, udp_checksum, IPPROTO_UDP, IPV4_MIN_HEADER_LEN, UDP_HEADER_LEN};
use crate::wire::wire_header::WireHeader;

/// the port encapsulated copies are sent to and from in tests
pub const TEST_DATA_PORT: u16 = 1001;

/// A complete IPv4 packet with a UDP datagram, without IP options and with valid checksums
pub fn udp_packet(src_addr: Ipv4Addr, src_port: u16, dest_addr: Ipv4Addr, dest_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;

    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total_len as u16);
    buf.put_u16(0); // identification
    buf.put_u16(0x4000); // don't fragment
    buf.put_u8(64);
    buf.put_u8(IPPROTO_UDP);
    buf.put_u16(0);
    buf.put_slice(&src_addr.octets());
    buf.put_slice(&dest_addr.octets());
    let checksum = ip_checksum(&buf[..IPV4_MIN_HEADER_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.put_u16(src_port);
    buf.put_u16(dest_port);
    buf.put_u16(udp_len as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
    let checksum = udp_checksum(src_addr, dest_addr, &buf[IPV4_MIN_HEADER_LEN..]);
    buf[IPV4_MIN_HEADER_LEN + 6..IPV4_MIN_HEADER_LEN + 8].copy_from_slice(&checksum.to_be_bytes());

    buf.to_vec()
}

/// An encapsulated copy as it arrives on a path: the IP addresses are those of the path's
///  interfaces, the header identifies the flow and the original destination port
pub fn iprp_packet(path_src: Ipv4Addr, path_dest: Ipv4Addr, flow_id: FlowIdentity, seq: u32, dest_port: u16, ind: Ind, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(WireHeader::SERIALIZED_LEN + payload.len());
    WireHeader::new(flow_id, seq, dest_port, ind).ser(&mut buf);
    buf.put_slice(payload);
    udp_packet(path_src, TEST_DATA_PORT, path_dest, TEST_DATA_PORT, &buf)
}
