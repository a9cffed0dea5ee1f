use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::registry::expiring_registry::ExpiringRegistry;
use crate::registry::snapshot::{Keyed, SnapshotRecord};
use crate::verdict::{PacketHandler, Verdict};
use crate::wire::ip_packet::UdpDatagram;

/// Observed senders are tracked per destination port rather than per source port: a sender
///  that is iPRP capable for one of its sockets is expected to be capable for all of them
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ObservedKey {
    pub src_addr: Ipv4Addr,
    pub dest_addr: Ipv4Addr,
    pub dest_port: u16,
}

/// A sender whose traffic arrives at this host, as seen by the monitor
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObservedSender {
    pub src_addr: Ipv4Addr,
    /// local address or multicast group
    pub dest_addr: Ipv4Addr,
    pub src_port: u16,
    pub dest_port: u16,
    /// whether traffic from this sender has arrived through redundant delivery
    pub iprp_capable: bool,
}

impl Keyed for ObservedSender {
    type Key = ObservedKey;

    fn key(&self) -> ObservedKey {
        ObservedKey {
            src_addr: self.src_addr,
            dest_addr: self.dest_addr,
            dest_port: self.dest_port,
        }
    }
}

impl SnapshotRecord for ObservedSender {
    const SERIALIZED_LEN: usize = 4 + 4 + 2 + 2 + 1;

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.src_addr.to_bits());
        buf.put_u32(self.dest_addr.to_bits());
        buf.put_u16(self.src_port);
        buf.put_u16(self.dest_port);
        buf.put_u8(self.iprp_capable as u8);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<ObservedSender> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow reading an observed sender");
        }
        Ok(ObservedSender {
            src_addr: Ipv4Addr::from_bits(buf.get_u32()),
            dest_addr: Ipv4Addr::from_bits(buf.get_u32()),
            src_port: buf.get_u16(),
            dest_port: buf.get_u16(),
            iprp_capable: buf.get_u8() != 0,
        })
    }
}

/// Keeps track of the senders whose traffic arrives at this host. Once traffic from a sender
///  arrives through redundant delivery, its traffic arriving by other means is dropped - the
///  copies reaching the application through dedup are authoritative.
pub struct SenderMonitor {
    senders: Arc<ExpiringRegistry<ObservedKey, ObservedSender>>,
    /// traffic to these ports (i.e. the protocol's own) is never dropped
    exempt_ports: Vec<u16>,
}

impl SenderMonitor {
    pub fn new(senders: Arc<ExpiringRegistry<ObservedKey, ObservedSender>>, exempt_ports: Vec<u16>) -> SenderMonitor {
        SenderMonitor {
            senders,
            exempt_ports,
        }
    }

    pub fn senders(&self) -> &Arc<ExpiringRegistry<ObservedKey, ObservedSender>> {
        &self.senders
    }

    /// Records a datagram from a sender and decides whether it may pass
    pub fn observe(&self, src_addr: Ipv4Addr, dest_addr: Ipv4Addr, src_port: u16, dest_port: u16, via_dedup: bool, now: Instant) -> Verdict {
        let key = ObservedKey {
            src_addr,
            dest_addr,
            dest_port,
        };

        let iprp_capable = self.senders.upsert_with(key, now,
            || {
                debug!(?key, via_dedup, "new sender");
                ObservedSender {
                    src_addr,
                    dest_addr,
                    src_port,
                    dest_port,
                    iprp_capable: via_dedup,
                }
            },
            |sender, _| {
                sender.src_port = src_port;
                if via_dedup && !sender.iprp_capable {
                    debug!(?key, "sender is iPRP capable");
                    sender.iprp_capable = true;
                }
                sender.iprp_capable
            });

        if via_dedup || !iprp_capable {
            Verdict::Accept
        }
        else {
            trace!(?key, "dropping datagram from iPRP capable sender that did not arrive through dedup");
            Verdict::Drop
        }
    }

    pub fn handle_packet(&self, packet: &[u8], via_dedup: bool, now: Instant) -> Verdict {
        let datagram = match UdpDatagram::parse(packet) {
            Ok(d) => d,
            Err(e) => {
                trace!("passing on unparsable packet: {}", e);
                return Verdict::Accept;
            }
        };
        if self.exempt_ports.contains(&datagram.dest_port) {
            return Verdict::Accept;
        }

        self.observe(datagram.src_addr, datagram.dest_addr, datagram.src_port, datagram.dest_port, via_dedup, now)
    }
}

/// One of the monitor's two inputs: incoming traffic in general, or the reconstructed datagrams
///  coming out of dedup
pub struct MonitorHandler {
    monitor: Arc<SenderMonitor>,
    via_dedup: bool,
}

impl MonitorHandler {
    pub fn new(monitor: Arc<SenderMonitor>, via_dedup: bool) -> MonitorHandler {
        MonitorHandler {
            monitor,
            via_dedup,
        }
    }
}

#[async_trait]
impl PacketHandler for MonitorHandler {
    async fn handle(&self, packet: &[u8]) -> Verdict {
        self.monitor.handle_packet(packet, self.via_dedup, Instant::now())
    }
}
