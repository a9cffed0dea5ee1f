use std::net::Ipv4Addr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};

use crate::host::{HostDescriptor, PathBitmap};

/// fixed value at the start of every control message, guarding against stray datagrams on the
///  control port
pub const CONTROL_MESSAGE_TAG: u32 = 0x3dbf_391e;

pub const PROTOCOL_VERSION: u32 = 1;

const ID_ANNOUNCE: u32 = 0;
const ID_ACKNOWLEDGE: u32 = 1;

/// Sent periodically by a receiving host to the senders it observes: advertises the announcing
///  host's interfaces for the flow identified by group address and ports.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnnounceData {
    pub protocol_version: u32,
    /// destination of the flow - the announcing host's address (or the multicast group)
    pub group_addr: Ipv4Addr,
    pub sender_addr: Ipv4Addr,
    pub inds: PathBitmap,
    pub src_port: u16,
    pub dest_port: u16,
    pub host: HostDescriptor,
}

/// The response to an [AnnounceData], carrying the responder's interfaces so both ends know
///  each other's reachable interfaces.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AcknowledgeData {
    pub host: HostDescriptor,
    pub group_addr: Ipv4Addr,
    pub sender_addr: Ipv4Addr,
}

/// Control messages have a fixed size regardless of their kind - the body is padded to the
///  size of the largest variant:
///
/// ```ascii
///  0: tag (u32) - CONTROL_MESSAGE_TAG
///  4: message type (u32) - 0 = Announce, 1 = Acknowledge
///  8: body
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    Announce(AnnounceData),
    Acknowledge(AcknowledgeData),
}

impl ControlMessage {
    const ANNOUNCE_BODY_LEN: usize = 4 + 4 + 4 + 2 + 2 + 2 + HostDescriptor::SERIALIZED_LEN;
    const ACKNOWLEDGE_BODY_LEN: usize = HostDescriptor::SERIALIZED_LEN + 4 + 4;
    const BODY_LEN: usize = if Self::ANNOUNCE_BODY_LEN > Self::ACKNOWLEDGE_BODY_LEN { Self::ANNOUNCE_BODY_LEN } else { Self::ACKNOWLEDGE_BODY_LEN };

    pub const SERIALIZED_LEN: usize = 8 + Self::BODY_LEN;

    pub fn id(&self) -> u32 {
        match self {
            ControlMessage::Announce(_) => ID_ANNOUNCE,
            ControlMessage::Acknowledge(_) => ID_ACKNOWLEDGE,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u32(CONTROL_MESSAGE_TAG);
        buf.put_u32(self.id());
        match self {
            ControlMessage::Announce(data) => Self::ser_announce(data, buf),
            ControlMessage::Acknowledge(data) => Self::ser_acknowledge(data, buf),
        }

        let written = buf.len() - start;
        buf.put_bytes(0, Self::SERIALIZED_LEN - written);
    }

    fn ser_announce(data: &AnnounceData, buf: &mut impl BufMut) {
        buf.put_u32(data.protocol_version);
        buf.put_u32(data.group_addr.to_bits());
        buf.put_u32(data.sender_addr.to_bits());
        buf.put_u16(data.inds.0);
        buf.put_u16(data.src_port);
        buf.put_u16(data.dest_port);
        data.host.ser(buf);
    }

    fn ser_acknowledge(data: &AcknowledgeData, buf: &mut impl BufMut) {
        data.host.ser(buf);
        buf.put_u32(data.group_addr.to_bits());
        buf.put_u32(data.sender_addr.to_bits());
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<ControlMessage> {
        if buf.len() != Self::SERIALIZED_LEN {
            bail!("control message has {} bytes, expected {}", buf.len(), Self::SERIALIZED_LEN);
        }

        let mut buf = buf;
        let tag = buf.get_u32();
        if tag != CONTROL_MESSAGE_TAG {
            bail!("invalid control message tag {:08x}", tag);
        }

        match buf.get_u32() {
            ID_ANNOUNCE => Self::deser_announce(buf),
            ID_ACKNOWLEDGE => Self::deser_acknowledge(buf),
            id => Err(anyhow!("invalid message discriminator {}", id)),
        }
    }

    fn deser_announce(mut buf: &[u8]) -> anyhow::Result<ControlMessage> {
        let protocol_version = buf.get_u32();
        let group_addr = Ipv4Addr::from_bits(buf.get_u32());
        let sender_addr = Ipv4Addr::from_bits(buf.get_u32());
        let inds = PathBitmap(buf.get_u16());
        let src_port = buf.get_u16();
        let dest_port = buf.get_u16();
        let host = HostDescriptor::try_deser(&mut buf)?;

        Ok(ControlMessage::Announce(AnnounceData {
            protocol_version,
            group_addr,
            sender_addr,
            inds,
            src_port,
            dest_port,
            host,
        }))
    }

    fn deser_acknowledge(mut buf: &[u8]) -> anyhow::Result<ControlMessage> {
        let host = HostDescriptor::try_deser(&mut buf)?;
        let group_addr = Ipv4Addr::from_bits(buf.get_u32());
        let sender_addr = Ipv4Addr::from_bits(buf.get_u32());

        Ok(ControlMessage::Acknowledge(AcknowledgeData {
            host,
            group_addr,
            sender_addr,
        }))
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use ControlMessage::*;

    use super::*;

    fn host() -> HostDescriptor {
        HostDescriptor::new([(1, Ipv4Addr::new(10, 0, 0, 1)), (2, Ipv4Addr::new(10, 0, 1, 1))]).unwrap()
    }

    fn announce() -> ControlMessage {
        Announce(AnnounceData {
            protocol_version: PROTOCOL_VERSION,
            group_addr: Ipv4Addr::new(10, 0, 0, 1),
            sender_addr: Ipv4Addr::new(10, 0, 0, 2),
            inds: PathBitmap(0b0110),
            src_port: 4000,
            dest_port: 5000,
            host: host(),
        })
    }

    fn acknowledge() -> ControlMessage {
        Acknowledge(AcknowledgeData {
            host: host(),
            group_addr: Ipv4Addr::new(239, 1, 1, 1),
            sender_addr: Ipv4Addr::new(10, 0, 0, 2),
        })
    }

    #[rstest]
    #[case::announce(announce(), ID_ANNOUNCE)]
    #[case::acknowledge(acknowledge(), ID_ACKNOWLEDGE)]
    fn test_ser_control_message(#[case] msg: ControlMessage, #[case] msg_id: u32) {
        assert_eq!(msg.id(), msg_id);

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert_eq!(buf.len(), ControlMessage::SERIALIZED_LEN);
        assert_eq!(&buf[..8], &[0x3d, 0xbf, 0x39, 0x1e, 0, 0, 0, msg_id as u8]);

        let deser_msg = ControlMessage::deser(&buf).unwrap();
        assert_eq!(msg, deser_msg);
    }

    #[rstest]
    #[case::truncated(|buf: &mut BytesMut| buf.truncate(buf.len() - 1))]
    #[case::extended(|buf: &mut BytesMut| buf.put_u8(0))]
    #[case::wrong_tag(|buf: &mut BytesMut| buf[0] = 0)]
    #[case::unknown_type(|buf: &mut BytesMut| buf[7] = 9)]
    fn test_deser_malformed(#[case] corrupt: fn(&mut BytesMut)) {
        let mut buf = BytesMut::new();
        announce().ser(&mut buf);
        corrupt(&mut buf);

        assert!(ControlMessage::deser(&buf).is_err());
    }
}
