use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Sends encapsulated datagrams on a specific path, i.e. from a specific local interface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PathSender: Send + Sync {
    async fn send_on_path(&self, local_addr: Ipv4Addr, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;
}

/// [PathSender] based on one UDP socket per local interface. Sockets are bound lazily, and a
///  socket is discarded after a failed send so the next datagram on that path binds a new one.
#[derive(Default)]
pub struct UdpPathSender {
    sockets: Mutex<FxHashMap<Ipv4Addr, Arc<UdpSocket>>>,
}

impl UdpPathSender {
    pub fn new() -> UdpPathSender {
        Default::default()
    }

    async fn socket_for(&self, local_addr: Ipv4Addr) -> anyhow::Result<Arc<UdpSocket>> {
        let mut sockets = self.sockets.lock().await;
        if let Some(socket) = sockets.get(&local_addr) {
            return Ok(socket.clone());
        }

        let socket = Arc::new(UdpSocket::bind((local_addr, 0)).await?);
        debug!("bound socket {:?} for sending on {}", socket.local_addr(), local_addr);
        sockets.insert(local_addr, socket.clone());
        Ok(socket)
    }
}

#[async_trait]
impl PathSender for UdpPathSender {
    async fn send_on_path(&self, local_addr: Ipv4Addr, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let socket = self.socket_for(local_addr).await?;

        if let Err(e) = socket.send_to(buf, to).await {
            warn!("error sending from {} to {:?}: {} - discarding socket", local_addr, to, e);
            self.sockets.lock().await.remove(&local_addr);
            return Err(e.into());
        }
        Ok(())
    }
}
