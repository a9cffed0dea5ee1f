use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, trace};

/// The decision for an intercepted packet, handed back to the packet source
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// let the packet continue unchanged
    Accept,
    Drop,
    /// replace the packet with the given bytes and let it continue
    Reinject(Vec<u8>),
    /// replace the packet and hand it to a different interception queue
    Requeue { target: u16, packet: Vec<u8> },
}

#[derive(Clone, Debug)]
pub struct InterceptedPacket {
    /// opaque id assigned by the packet source, used to deliver the verdict
    pub id: u64,
    /// raw IP packet, starting with the IP header
    pub bytes: Vec<u8>,
}

/// Abstraction over the mechanism that intercepts packets (e.g. a netfilter queue) and applies
///  verdicts to them. Every packet returned by [PacketSource::recv] must receive exactly one
///  verdict.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PacketSource: Send + Sync {
    async fn recv(&self) -> anyhow::Result<InterceptedPacket>;
    async fn set_verdict(&self, packet_id: u64, verdict: Verdict) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, packet: &[u8]) -> Verdict;
}

/// Takes packets from a source one at a time, processing each to completion before receiving the
///  next. Returns when the source fails.
pub async fn run_packet_loop(name: &'static str, source: Arc<dyn PacketSource>, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()> {
    info!("starting packet loop {}", name);

    loop {
        let packet = source.recv().await?;
        let verdict = handler.handle(&packet.bytes).await;
        trace!(packet_loop = name, id = packet.id, ?verdict, "verdict");
        source.set_verdict(packet.id, verdict).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use anyhow::anyhow;
    use mockall::predicate::eq;
    use super::*;

    struct LengthHandler {}

    #[async_trait]
    impl PacketHandler for LengthHandler {
        async fn handle(&self, packet: &[u8]) -> Verdict {
            if packet.len() > 2 { Verdict::Drop } else { Verdict::Accept }
        }
    }

    #[tokio::test]
    async fn test_packet_loop() {
        let mut source = MockPacketSource::new();

        let counter = AtomicU64::new(0);
        source.expect_recv()
            .times(3)
            .returning(move || {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(InterceptedPacket { id: 10, bytes: vec![1] }),
                    1 => Ok(InterceptedPacket { id: 11, bytes: vec![1, 2, 3] }),
                    _ => Err(anyhow!("closed")),
                }
            });
        source.expect_set_verdict()
            .with(eq(10), eq(Verdict::Accept))
            .times(1)
            .returning(|_, _| Ok(()));
        source.expect_set_verdict()
            .with(eq(11), eq(Verdict::Drop))
            .times(1)
            .returning(|_, _| Ok(()));

        let result = run_packet_loop("test", Arc::new(source), Arc::new(LengthHandler {})).await;
        assert!(result.is_err());
    }
}
