use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::data::monitor::SenderMonitor;
use crate::flow_id::FlowIdentity;
use crate::registry::expiring_registry::ExpiringRegistry;
use crate::verdict::{PacketHandler, Verdict};
use crate::wire::ip_packet::UdpDatagram;
use crate::wire::wire_header::WireHeader;

/// Size of the reorder horizon: a sequence number that is skipped can arrive up to this many
///  numbers late and still be recognized as fresh.
///
/// NB: Two sequence numbers that are exactly WINDOW apart share a slot. A still pending number
///  is forgotten when the slot is reused for a newer one, i.e. it is then treated as a duplicate.
///  Numbers more than WINDOW behind the high water mark are duplicates regardless of their slot.
///  Since u32::MAX is not a multiple of WINDOW, numbers WINDOW - 1 apart share a slot when the
///  wrap lies between them.
pub const WINDOW: usize = 1024;

/// Sequence numbers are in 1..=u32::MAX, i.e. on a ring with u32::MAX elements
const RING_SIZE: u64 = u32::MAX as u64;

/// distance from `from` to `to`, going forward on the sequence number ring
fn ring_distance(from: u32, to: u32) -> u64 {
    (to as u64 + RING_SIZE - from as u64) % RING_SIZE
}

/// the sequence number `n` steps before `seq`
fn ring_sub(seq: u32, n: u64) -> u32 {
    ((seq as u64 - 1 + RING_SIZE - n % RING_SIZE) % RING_SIZE + 1) as u32
}

fn ring_next(seq: u32) -> u32 {
    if seq == u32::MAX { 1 } else { seq + 1 }
}

fn slot(seq: u32) -> usize {
    seq as usize % WINDOW
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    Fresh,
    Duplicate,
}

/// Receiver-side state for a single flow
#[derive(Clone)]
pub struct ReceiverFlow {
    pub flow_id: FlowIdentity,
    /// recorded when the flow is created - the addresses of the encapsulating packets depend on
    ///  the path and are not used
    pub sender_addr: Ipv4Addr,
    pub sender_port: u16,
    /// the highest sequence number seen so far
    pub high_sn: u32,
    /// Sequence numbers that were skipped and are still expected, at `seq % WINDOW`. 0 marks an
    ///  empty slot.
    pending: Box<[u32; WINDOW]>,
}

impl ReceiverFlow {
    /// a new flow, with `first_seq` counting as seen
    pub fn new(flow_id: FlowIdentity, first_seq: u32) -> ReceiverFlow {
        ReceiverFlow {
            flow_id,
            sender_addr: flow_id.sender_addr(),
            sender_port: flow_id.sender_port(),
            high_sn: first_seq,
            pending: Box::new([0; WINDOW]),
        }
    }

    pub fn is_pending(&self, seq: u32) -> bool {
        seq != 0 && self.pending[slot(seq)] == seq
    }

    pub fn classify(&mut self, seq: u32) -> Classification {
        if seq == 0 || seq == self.high_sn {
            return Classification::Duplicate;
        }

        let ahead = ring_distance(self.high_sn, seq);
        if ahead <= RING_SIZE / 2 {
            self.advance_to(seq, ahead);
            return Classification::Fresh;
        }

        let behind = RING_SIZE - ahead;
        let slot = slot(seq);
        if behind > WINDOW as u64 {
            debug!(flow_id = ?self.flow_id, seq, high_sn = self.high_sn, "very late packet");
            // across the wrap, slots do not repeat every WINDOW numbers and one can hold a stale
            //  entry
            if self.pending[slot] == seq {
                self.pending[slot] = 0;
            }
            return Classification::Duplicate;
        }

        if self.pending[slot] == seq {
            self.pending[slot] = 0;
            Classification::Fresh
        }
        else {
            Classification::Duplicate
        }
    }

    /// Marks the numbers skipped between the old high water mark and `seq` as pending. Only the
    ///  most recent WINDOW of them are marked since older ones would share slots with them.
    fn advance_to(&mut self, seq: u32, ahead: u64) {
        // the old high water mark's slot can only hold the number WINDOW before it, which is out
        //  of reach now
        self.pending[slot(self.high_sn)] = 0;

        let num_skipped = (ahead - 1).min(WINDOW as u64);
        let mut skipped = ring_sub(seq, num_skipped);
        for _ in 0..num_skipped {
            self.pending[slot(skipped)] = skipped;
            skipped = ring_next(skipped);
        }

        self.high_sn = seq;
    }
}

/// Classifies incoming encapsulated datagrams, and restores the original datagram for the first
///  copy of each sequence number.
pub struct DedupEngine {
    flows: Arc<ExpiringRegistry<FlowIdentity, ReceiverFlow>>,
    monitor: Option<Arc<SenderMonitor>>,
    requeue_target: Option<u16>,
}

impl DedupEngine {
    pub fn new(flows: Arc<ExpiringRegistry<FlowIdentity, ReceiverFlow>>, monitor: Option<Arc<SenderMonitor>>, requeue_target: Option<u16>) -> DedupEngine {
        DedupEngine {
            flows,
            monitor,
            requeue_target,
        }
    }

    pub fn flows(&self) -> &Arc<ExpiringRegistry<FlowIdentity, ReceiverFlow>> {
        &self.flows
    }

    /// `packet` is the full IP packet carrying an encapsulated copy
    pub fn process(&self, packet: &[u8], now: Instant) -> Verdict {
        let datagram = match UdpDatagram::parse(packet) {
            Ok(d) => d,
            Err(e) => {
                debug!("dropping packet: {}", e);
                return Verdict::Drop;
            }
        };

        let mut payload = datagram.payload();
        let header = match WireHeader::deser(&mut payload) {
            Ok(h) => h,
            Err(e) => {
                debug!("dropping packet from {}: {}", datagram.src_addr, e);
                return Verdict::Drop;
            }
        };

        let (classification, sender_addr, sender_port) = self.flows.upsert_with(
            header.flow_id,
            now,
            || ReceiverFlow::new(header.flow_id, header.seq),
            |flow, created| {
                let classification = if created {
                    debug!(flow_id = ?header.flow_id, seq = header.seq, "new flow");
                    Classification::Fresh
                }
                else {
                    flow.classify(header.seq)
                };
                (classification, flow.sender_addr, flow.sender_port)
            });

        if classification == Classification::Duplicate {
            trace!(flow_id = ?header.flow_id, seq = header.seq, ind = header.ind, "duplicate");
            return Verdict::Drop;
        }
        trace!(flow_id = ?header.flow_id, seq = header.seq, ind = header.ind, "fresh");

        let rebuilt = match datagram.rebuild(sender_addr, sender_port, header.dest_port, payload) {
            Ok(p) => p,
            Err(e) => {
                debug!("cannot restore datagram: {}", e);
                return Verdict::Drop;
            }
        };

        match self.requeue_target {
            Some(target) => Verdict::Requeue { target, packet: rebuilt },
            None => {
                // requeued datagrams reach the monitor through its own queue
                if let Some(monitor) = &self.monitor {
                    let _ = monitor.observe(sender_addr, datagram.dest_addr, sender_port, header.dest_port, true, now);
                }
                Verdict::Reinject(rebuilt)
            }
        }
    }
}

#[async_trait]
impl PacketHandler for DedupEngine {
    async fn handle(&self, packet: &[u8]) -> Verdict {
        self.process(packet, Instant::now())
    }
}
