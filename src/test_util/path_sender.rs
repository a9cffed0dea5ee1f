use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::data::transport::PathSender;

/// [PathSender] that records everything it is asked to send, in order
#[derive(Debug, Default)]
pub struct TrackingPathSender {
    tracker: Mutex<Vec<(Ipv4Addr, SocketAddr, Vec<u8>)>>,
}

impl TrackingPathSender {
    pub fn new() -> Self {
        Default::default()
    }

    fn tracker(&self) -> MutexGuard<'_, Vec<(Ipv4Addr, SocketAddr, Vec<u8>)>> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// removes the oldest recorded send and checks it against the expected values
    pub fn assert_sent(&self, local_addr: Ipv4Addr, to: SocketAddr, buf: &[u8]) {
        let mut lock = self.tracker();
        if lock.is_empty() {
            panic!("nothing was sent");
        }

        let (actual_local, actual_to, actual_buf) = lock.remove(0);
        assert_eq!(actual_local, local_addr);
        assert_eq!(actual_to, to);
        assert_eq!(actual_buf.as_slice(), buf);
    }

    pub fn assert_no_remaining_sends(&self) {
        assert!(self.tracker().is_empty());
    }

    pub fn num_sent(&self) -> usize {
        self.tracker().len()
    }
}

#[async_trait]
impl PathSender for TrackingPathSender {
    async fn send_on_path(&self, local_addr: Ipv4Addr, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.tracker().push((local_addr, to, buf.to_vec()));
        Ok(())
    }
}
