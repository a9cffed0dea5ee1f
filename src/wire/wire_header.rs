use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::flow_id::FlowIdentity;
use crate::host::Ind;

/// Header that the duplicator puts in front of every copy of a datagram, immediately after the
///  UDP header of the encapsulating packet. All numbers are in network byte order (BE):
///
/// ```ascii
///   0: version (u8)
///   1: flow identity (20 bytes)
///  21: sequence number (u32) - 1..=u32::MAX, never 0
///  25: original UDP destination port (u16)
///  27: IND of the path this copy was sent on (u8)
///  28: authentication (160 bytes) - reserved, sent as zeroes
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireHeader {
    pub version: u8,
    pub flow_id: FlowIdentity,
    pub seq: u32,
    pub dest_port: u16,
    pub ind: Ind,
}

impl WireHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const AUTH_LEN: usize = 160;
    pub const SERIALIZED_LEN: usize = 1 + FlowIdentity::SIZE + 4 + 2 + 1 + Self::AUTH_LEN;

    pub fn new(flow_id: FlowIdentity, seq: u32, dest_port: u16, ind: Ind) -> WireHeader {
        WireHeader {
            version: Self::PROTOCOL_VERSION_1,
            flow_id,
            seq,
            dest_port,
            ind,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_slice(&self.flow_id.0);
        buf.put_u32(self.seq);
        buf.put_u16(self.dest_port);
        buf.put_u8(self.ind);
        buf.put_bytes(0, Self::AUTH_LEN);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<WireHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow: {} bytes for a {} byte header", buf.remaining(), Self::SERIALIZED_LEN);
        }

        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let mut flow_id = [0u8; FlowIdentity::SIZE];
        buf.copy_to_slice(&mut flow_id);
        let seq = buf.get_u32();
        if seq == 0 {
            bail!("sequence number 0 is reserved");
        }
        let dest_port = buf.get_u16();
        let ind = buf.get_u8();
        buf.advance(Self::AUTH_LEN);

        Ok(WireHeader {
            version,
            flow_id: FlowIdentity(flow_id),
            seq,
            dest_port,
            ind,
        })
    }
}
