use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::verdict::{InterceptedPacket, PacketSource, Verdict};

/// [PacketSource] fed through a channel. Verdicts are recorded in the order they are set, and
///  [PacketSource::recv] fails once all senders of the channel are dropped.
pub struct ChannelPacketSource {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    next_id: AtomicU64,
    verdicts: Mutex<Vec<(u64, Verdict)>>,
}

impl ChannelPacketSource {
    pub fn new() -> (ChannelPacketSource, mpsc::Sender<Vec<u8>>) {
        let (send, recv) = mpsc::channel(64);
        let source = ChannelPacketSource {
            receiver: tokio::sync::Mutex::new(recv),
            next_id: AtomicU64::new(1),
            verdicts: Default::default(),
        };
        (source, send)
    }

    fn verdicts(&self) -> MutexGuard<'_, Vec<(u64, Verdict)>> {
        self.verdicts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// waits until at least `n` verdicts were set, returning them in the order of their packets
    pub async fn await_verdicts(&self, n: usize) -> Vec<Verdict> {
        loop {
            {
                let verdicts = self.verdicts();
                if verdicts.len() >= n {
                    let mut result = verdicts.clone();
                    result.sort_by_key(|(id, _)| *id);
                    return result.into_iter().map(|(_, v)| v).collect();
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl PacketSource for ChannelPacketSource {
    async fn recv(&self) -> anyhow::Result<InterceptedPacket> {
        let bytes = self.receiver.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("packet source was closed"))?;
        Ok(InterceptedPacket {
            id: self.next_id.fetch_add(1, Ordering::AcqRel),
            bytes,
        })
    }

    async fn set_verdict(&self, packet_id: u64, verdict: Verdict) -> anyhow::Result<()> {
        self.verdicts().push((packet_id, verdict));
        Ok(())
    }
}
