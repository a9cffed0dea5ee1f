use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::control::peer_link::{LinkKey, PeerLink};
use crate::control::supervisor::Duplicators;
use crate::data::transport::PathSender;
use crate::registry::expiring_registry::ExpiringRegistry;
use crate::verdict::{PacketHandler, Verdict};
use crate::wire::ip_packet::UdpDatagram;
use crate::wire::wire_header::WireHeader;

/// Sequence numbers for one flow: 1, 2, ..., u32::MAX, 1, 2, ... - 0 is never returned
pub struct SequenceCounter {
    next: AtomicU32,
}

impl SequenceCounter {
    pub fn new() -> SequenceCounter {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> SequenceCounter {
        SequenceCounter {
            next: AtomicU32::new(first.max(1)),
        }
    }

    pub fn next(&self) -> u32 {
        let result = self.next.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(if n == u32::MAX { 1 } else { n + 1 })
        });
        // the closure always returns Some
        match result {
            Ok(n) | Err(n) => n,
        }
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Emits one encapsulated copy of each original datagram per path of a peer link.
///
/// The duplicator holds the link's key rather than the link itself, so paths added (or the link
///  evicted) by the control protocol take effect for the next datagram.
pub struct Duplicator {
    key: LinkKey,
    links: Arc<ExpiringRegistry<LinkKey, PeerLink>>,
    sender: Arc<dyn PathSender>,
    data_port: u16,
    seq: SequenceCounter,
}

impl Duplicator {
    pub fn new(key: LinkKey, links: Arc<ExpiringRegistry<LinkKey, PeerLink>>, sender: Arc<dyn PathSender>, data_port: u16) -> Duplicator {
        Duplicator {
            key,
            links,
            sender,
            data_port,
            seq: SequenceCounter::new(),
        }
    }

    pub fn key(&self) -> LinkKey {
        self.key
    }

    /// Sends `payload` (the original datagram's UDP payload) on all of the link's paths,
    ///  returning the number of successful sends. A failure on one path does not affect the others.
    pub async fn duplicate(&self, payload: &[u8]) -> anyhow::Result<usize> {
        let (flow_id, paths) = self.links.with_value(&self.key, |link| (link.flow_id, link.paths.clone()))
            .ok_or_else(|| anyhow!("no peer link for {:?}", self.key))?;

        if paths.is_empty() {
            debug!(key = ?self.key, "peer link has no paths - not sending");
            return Ok(0);
        }

        let seq = self.seq.next();
        let mut buf = BytesMut::with_capacity(WireHeader::SERIALIZED_LEN + payload.len());
        let mut num_sent = 0;

        for path in paths {
            buf.clear();
            WireHeader::new(flow_id, seq, self.key.dest_port, path.ind).ser(&mut buf);
            buf.put_slice(payload);

            let to = SocketAddr::from((path.remote_addr, self.data_port));
            match self.sender.send_on_path(path.local_addr, to, &buf).await {
                Ok(()) => {
                    trace!(?flow_id, seq, ind = path.ind, "sent copy to {:?}", to);
                    num_sent += 1;
                }
                Err(e) => {
                    warn!(?flow_id, seq, ind = path.ind, "error sending copy to {:?}: {}", to, e);
                }
            }
        }
        Ok(num_sent)
    }
}

/// Handles outgoing datagrams: datagrams of a flow with a duplicator are replaced by their
///  encapsulated copies, everything else passes unchanged
pub struct OutboundHandler {
    duplicators: Arc<Duplicators>,
    control_port: u16,
    data_port: u16,
}

impl OutboundHandler {
    pub fn new(duplicators: Arc<Duplicators>, control_port: u16, data_port: u16) -> OutboundHandler {
        OutboundHandler {
            duplicators,
            control_port,
            data_port,
        }
    }
}

#[async_trait]
impl PacketHandler for OutboundHandler {
    async fn handle(&self, packet: &[u8]) -> Verdict {
        let datagram = match UdpDatagram::parse(packet) {
            Ok(d) => d,
            Err(e) => {
                trace!("passing on outgoing packet: {}", e);
                return Verdict::Accept;
            }
        };
        if datagram.dest_port == self.control_port || datagram.dest_port == self.data_port {
            return Verdict::Accept;
        }

        let key = LinkKey {
            dest_addr: datagram.dest_addr,
            src_port: datagram.src_port,
            dest_port: datagram.dest_port,
        };
        let Some(duplicator) = self.duplicators.get(&key) else {
            return Verdict::Accept;
        };

        // the original is never forwarded, whether or not the copies could be sent
        if let Err(e) = duplicator.duplicate(datagram.payload()).await {
            debug!("dropping datagram for {:?}: {}", key, e);
        }
        Verdict::Drop
    }
}
