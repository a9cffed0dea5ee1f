use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::IprpConfig;
use crate::control::backoff::backoff_delay;
use crate::control::control_logic::ControlProtocol;
use crate::data::monitor::SenderMonitor;
use crate::util::random::Random;
use crate::wire::control_messages::ControlMessage;

pub mod backoff;
pub mod control_logic;
pub mod peer_link;
pub mod supervisor;


/// Runs the control protocol on `socket`: incoming Announce / Acknowledge messages are processed
///  as they arrive, and each observed sender gets an Announce once per round. Socket errors are
///  logged and do not terminate the loop.
pub async fn run_control<R: Random>(config: Arc<IprpConfig>, socket: Arc<UdpSocket>, protocol: Arc<ControlProtocol<R>>, monitor: Arc<SenderMonitor>) -> anyhow::Result<()> {
    info!("starting control protocol on {:?}", socket.local_addr());

    let mut receive_buffer = vec![0u8; 2048];
    let mut next_announce = Instant::now() + next_announce_delay::<R>(&config);

    loop {
        select! {
            recv_result = socket.recv_from(&mut receive_buffer) => {
                match recv_result {
                    Ok((len, from)) => {
                        on_datagram(&socket, protocol.as_ref(), from, &receive_buffer[..len]).await;
                    }
                    Err(e) => {
                        warn!("error receiving control message: {}", e);
                    }
                }
            }
            _ = sleep_until(next_announce) => {
                let observed = monitor.senders().entries().into_iter()
                    .map(|(_, sender)| sender)
                    .collect::<Vec<_>>();
                let announcements = protocol.announcements(&observed);
                trace!("sending {} Announce messages", announcements.len());
                for (to, msg) in announcements {
                    send(&socket, to, &msg).await;
                }

                next_announce = Instant::now() + next_announce_delay::<R>(&config);
            }
        }
    }
}

fn next_announce_delay<R: Random>(config: &IprpConfig) -> std::time::Duration {
    backoff_delay::<R>(config.announce_interval, config.announce_backoff_scale, config.announce_backoff_lambda)
}

async fn on_datagram<R: Random>(socket: &UdpSocket, protocol: &ControlProtocol<R>, from: SocketAddr, buf: &[u8]) {
    let SocketAddr::V4(from_v4) = from else {
        debug!("ignoring control message from {:?}", from);
        return;
    };

    let msg = match ControlMessage::deser(buf) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dropping malformed control message from {:?}: {}", from, e);
            return;
        }
    };

    if let Some((to, reply)) = protocol.on_message(*from_v4.ip(), msg, Instant::now()) {
        send(socket, to, &reply).await;
    }
}

async fn send(socket: &UdpSocket, to: SocketAddr, msg: &ControlMessage) {
    let mut buf = BytesMut::with_capacity(ControlMessage::SERIALIZED_LEN);
    msg.ser(&mut buf);
    if let Err(e) = socket.send_to(&buf, to).await {
        warn!("error sending control message to {:?}: {}", to, e);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use mockall::predicate::eq;
    use tokio::time::timeout;
    use crate::control::peer_link::LinkKey;
    use crate::control::supervisor::MockSupervisor;
    use crate::data::monitor::ObservedKey;
    use crate::host::HostDescriptor;
    use crate::registry::expiring_registry::ExpiringRegistry;
    use crate::util::random::RngRandom;
    use crate::wire::control_messages::{AnnounceData, PROTOCOL_VERSION};
    use super::*;

    const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

    fn host() -> HostDescriptor {
        HostDescriptor::new([(1, LOCALHOST)]).unwrap()
    }

    /// binds the node's control socket and a peer socket; the node addresses the peer through
    ///  the configured control port
    async fn setup(supervisor: MockSupervisor) -> (UdpSocket, Arc<UdpSocket>, Arc<IprpConfig>, Arc<ControlProtocol<RngRandom>>, Arc<SenderMonitor>) {
        let peer = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let node = Arc::new(UdpSocket::bind((LOCALHOST, 0)).await.unwrap());

        let mut config = IprpConfig::new(host());
        config.control_port = peer.local_addr().unwrap().port();
        config.announce_interval = Duration::from_millis(20);
        config.announce_backoff_scale = Duration::from_millis(20);
        let config = Arc::new(config);

        let protocol = Arc::new(ControlProtocol::new(
            config.clone(),
            Arc::new(ExpiringRegistry::new("peer-links", Duration::from_secs(60))),
            Arc::new(ExpiringRegistry::new("sender-interfaces", Duration::from_secs(60))),
            Arc::new(supervisor),
        ));
        let monitor = Arc::new(SenderMonitor::new(Arc::new(ExpiringRegistry::new("observed-senders", Duration::from_secs(60))), vec![]));
        (peer, node, config, protocol, monitor)
    }

    async fn recv_control_message(peer: &UdpSocket) -> ControlMessage {
        let mut buf = vec![0u8; 2048];
        let (len, _) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf)).await.unwrap().unwrap();
        ControlMessage::deser(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_announce_is_acknowledged() {
        let key = LinkKey { dest_addr: LOCALHOST, src_port: 4000, dest_port: 5000 };
        let mut supervisor = MockSupervisor::new();
        supervisor.expect_start_duplicator()
            .with(eq(key))
            .times(1)
            .return_const(());

        let (peer, node, config, protocol, monitor) = setup(supervisor).await;
        let node_addr = node.local_addr().unwrap();
        let handle = tokio::spawn(run_control(config, node, protocol.clone(), monitor));

        let mut buf = BytesMut::new();
        ControlMessage::Announce(AnnounceData {
            protocol_version: PROTOCOL_VERSION,
            group_addr: LOCALHOST,
            sender_addr: LOCALHOST,
            inds: host().bitmap(),
            src_port: 4000,
            dest_port: 5000,
            host: host(),
        }).ser(&mut buf);

        // garbage first: it must be dropped without affecting the next message
        peer.send_to(b"garbage", node_addr).await.unwrap();
        peer.send_to(&buf, node_addr).await.unwrap();

        match recv_control_message(&peer).await {
            ControlMessage::Acknowledge(data) => {
                assert_eq!(data.host, host());
                assert_eq!(data.group_addr, LOCALHOST);
            }
            msg => panic!("unexpected message {:?}", msg),
        }
        assert!(protocol.links().contains_key(&key));

        handle.abort();
    }

    #[tokio::test]
    async fn test_announce_round() {
        let (peer, node, config, protocol, monitor) = setup(MockSupervisor::new()).await;
        monitor.observe(LOCALHOST, LOCALHOST, 4000, 5000, false, Instant::now());
        assert!(monitor.senders().contains_key(&ObservedKey { src_addr: LOCALHOST, dest_addr: LOCALHOST, dest_port: 5000 }));

        let handle = tokio::spawn(run_control(config, node, protocol, monitor));

        match recv_control_message(&peer).await {
            ControlMessage::Announce(data) => {
                assert_eq!(data.sender_addr, LOCALHOST);
                assert_eq!(data.src_port, 4000);
                assert_eq!(data.dest_port, 5000);
                assert_eq!(data.inds, host().bitmap());
            }
            msg => panic!("unexpected message {:?}", msg),
        }

        handle.abort();
    }
}
