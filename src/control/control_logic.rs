use std::marker::PhantomData;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::config::IprpConfig;
use crate::control::peer_link::{LinkKey, Path, PeerLink, SenderInterfaces, SenderKey};
use crate::control::supervisor::Supervisor;
use crate::data::monitor::ObservedSender;
use crate::flow_id::FlowIdentity;
use crate::host::{ind_match, PathBitmap};
use crate::registry::expiring_registry::ExpiringRegistry;
use crate::util::random::{Random, RngRandom};
use crate::wire::control_messages::{AcknowledgeData, AnnounceData, ControlMessage, PROTOCOL_VERSION};

/// The control protocol's state transitions, independent of sockets and timers.
///
/// A peer link is created by the first Announce for its flow that has matching interfaces, kept
///  alive by subsequent Announce messages and removed by the registry's sweep. Link creation is
///  the trigger for starting a duplicator.
pub struct ControlProtocol<R: Random = RngRandom> {
    config: Arc<IprpConfig>,
    links: Arc<ExpiringRegistry<LinkKey, PeerLink>>,
    sender_interfaces: Arc<ExpiringRegistry<SenderKey, SenderInterfaces>>,
    supervisor: Arc<dyn Supervisor>,
    reboot_counter: AtomicU16,
    _random: PhantomData<fn() -> R>,
}

impl <R: Random> ControlProtocol<R> {
    pub fn new(
        config: Arc<IprpConfig>,
        links: Arc<ExpiringRegistry<LinkKey, PeerLink>>,
        sender_interfaces: Arc<ExpiringRegistry<SenderKey, SenderInterfaces>>,
        supervisor: Arc<dyn Supervisor>,
    ) -> ControlProtocol<R> {
        // a random start makes flow identities of a restarted process differ from the previous ones
        let reboot_counter = R::next_u16();
        debug!("initial reboot counter {}", reboot_counter);

        ControlProtocol {
            config,
            links,
            sender_interfaces,
            supervisor,
            reboot_counter: AtomicU16::new(reboot_counter),
            _random: Default::default(),
        }
    }

    pub fn links(&self) -> &Arc<ExpiringRegistry<LinkKey, PeerLink>> {
        &self.links
    }

    /// Processes a control message received from `from`, returning a reply to send (if any)
    pub fn on_message(&self, from: Ipv4Addr, msg: ControlMessage, now: Instant) -> Option<(SocketAddr, ControlMessage)> {
        match msg {
            ControlMessage::Announce(data) => self.on_announce(from, data, now),
            ControlMessage::Acknowledge(data) => {
                self.on_acknowledge(data, now);
                None
            }
        }
    }

    fn on_announce(&self, from: Ipv4Addr, data: AnnounceData, now: Instant) -> Option<(SocketAddr, ControlMessage)> {
        if data.protocol_version != PROTOCOL_VERSION {
            debug!("ignoring Announce with protocol version {} from {}", data.protocol_version, from);
            return None;
        }

        let key = LinkKey {
            dest_addr: data.group_addr,
            src_port: data.src_port,
            dest_port: data.dest_port,
        };
        let matched = ind_match(&self.config.host, data.inds);

        let refreshed = self.links.refresh_with(&key, now, |link| {
            let added = link.merge_inds(matched, &self.config.host, &data.host);
            if !added.is_empty() {
                debug!(?key, ?added, "added interfaces to peer link");
            }
        });

        if refreshed.is_none() {
            if matched.is_empty() {
                debug!(?key, remote = ?data.inds, local = ?self.config.host.bitmap(), "no matching interfaces - ignoring Announce");
                return None;
            }

            let link = self.create_link(key, &data, matched);
            info!(?key, flow_id = ?link.flow_id, inds = ?link.inds, "created peer link with {} paths", link.paths.len());
            self.links.insert(key, link, now);
            self.supervisor.start_duplicator(key);
        }
        else {
            trace!(?key, "refreshed peer link");
        }

        if !self.config.send_acknowledge {
            return None;
        }
        let reply = ControlMessage::Acknowledge(AcknowledgeData {
            host: self.config.host.clone(),
            group_addr: data.group_addr,
            sender_addr: data.sender_addr,
        });
        Some((SocketAddr::from((from, self.config.control_port)), reply))
    }

    fn create_link(&self, key: LinkKey, data: &AnnounceData, matched: PathBitmap) -> PeerLink {
        let reboot_counter = self.reboot_counter.fetch_add(1, Ordering::AcqRel);
        PeerLink {
            key,
            sender_addr: data.sender_addr,
            flow_id: FlowIdentity::new(data.sender_addr, data.src_port, reboot_counter),
            inds: matched,
            paths: Path::for_inds(matched, &self.config.host, &data.host),
        }
    }

    fn on_acknowledge(&self, data: AcknowledgeData, now: Instant) {
        let key = SenderKey {
            group_addr: data.group_addr,
            sender_addr: data.sender_addr,
        };
        let interfaces = SenderInterfaces::new(key, &data.host, &self.config.host);
        trace!(?key, "Acknowledge with {} shared interfaces", interfaces.interfaces.len());

        self.sender_interfaces.insert(key, interfaces, now);
    }

    /// The Announce messages for one round, one per observed sender
    pub fn announcements(&self, observed: &[ObservedSender]) -> Vec<(SocketAddr, ControlMessage)> {
        let inds = self.config.host.bitmap();

        observed.iter()
            .map(|sender| {
                let msg = ControlMessage::Announce(AnnounceData {
                    protocol_version: PROTOCOL_VERSION,
                    group_addr: sender.dest_addr,
                    sender_addr: sender.src_addr,
                    inds,
                    src_port: sender.src_port,
                    dest_port: sender.dest_port,
                    host: self.config.host.clone(),
                });
                (SocketAddr::from((sender.src_addr, self.config.control_port)), msg)
            })
            .collect()
    }

    /// Called for peer links removed by the sweep
    pub fn on_link_expired(&self, key: LinkKey) {
        info!(?key, "peer link expired");
        self.supervisor.stop_duplicator(key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use mockall::predicate::eq;
    use crate::control::supervisor::MockSupervisor;
    use crate::host::{HostDescriptor, Ind, Interface};
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use super::*;

    fn host(interfaces: &[(Ind, [u8; 4])]) -> HostDescriptor {
        HostDescriptor::new(interfaces.iter().map(|(ind, a)| (*ind, Ipv4Addr::from(*a)))).unwrap()
    }

    fn key() -> LinkKey {
        LinkKey { dest_addr: Ipv4Addr::new(10, 0, 0, 1), src_port: 4000, dest_port: 5000 }
    }

    fn announce(remote: HostDescriptor) -> ControlMessage {
        ControlMessage::Announce(AnnounceData {
            protocol_version: PROTOCOL_VERSION,
            group_addr: Ipv4Addr::new(10, 0, 0, 1),
            sender_addr: Ipv4Addr::new(10, 0, 0, 9),
            inds: remote.bitmap(),
            src_port: 4000,
            dest_port: 5000,
            host: remote,
        })
    }

    /// receiving host with INDs 1 and 2
    fn receiver() -> HostDescriptor {
        host(&[(1, [10, 0, 0, 1]), (2, [10, 0, 0, 2])])
    }

    fn protocol(local: HostDescriptor, supervisor: MockSupervisor, send_acknowledge: bool) -> ControlProtocol<MockRandom> {
        let ctx = MockRandom::next_u16_context();
        ctx.expect().returning(|| 7);

        let mut config = IprpConfig::new(local);
        config.send_acknowledge = send_acknowledge;
        ControlProtocol::new(
            Arc::new(config),
            Arc::new(ExpiringRegistry::new("links", Duration::from_secs(60))),
            Arc::new(ExpiringRegistry::new("sender-interfaces", Duration::from_secs(60))),
            Arc::new(supervisor),
        )
    }

    #[test]
    fn test_link_creation_single_shared_interface() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let mut supervisor = MockSupervisor::new();
        supervisor.expect_start_duplicator()
            .with(eq(key()))
            .times(1)
            .return_const(());

        // the sending host only has IND 1
        let protocol = protocol(host(&[(1, [10, 0, 0, 9])]), supervisor, false);
        let reply = protocol.on_message(Ipv4Addr::new(10, 0, 0, 1), announce(receiver()), Instant::now());
        assert!(reply.is_none());

        let link = protocol.links().get_cloned(&key()).unwrap();
        assert_eq!(link.inds, PathBitmap(0b0010));
        assert_eq!(link.paths, vec![Path {
            ind: 1,
            local_addr: Ipv4Addr::new(10, 0, 0, 9),
            remote_addr: Ipv4Addr::new(10, 0, 0, 1),
        }]);
        assert_eq!(link.flow_id, FlowIdentity::new(Ipv4Addr::new(10, 0, 0, 9), 4000, 7));
    }

    #[test]
    fn test_no_matching_interfaces() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let mut supervisor = MockSupervisor::new();
        supervisor.expect_start_duplicator().never();

        let protocol = protocol(host(&[(3, [10, 3, 0, 9])]), supervisor, true);
        let reply = protocol.on_message(Ipv4Addr::new(10, 0, 0, 1), announce(receiver()), Instant::now());
        assert!(reply.is_none());
        assert!(protocol.links().is_empty());
    }

    #[test]
    fn test_refresh_merges_new_interfaces() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let mut supervisor = MockSupervisor::new();
        supervisor.expect_start_duplicator()
            .times(1)
            .return_const(());

        let protocol = protocol(host(&[(1, [10, 0, 0, 9]), (2, [10, 0, 1, 9])]), supervisor, false);
        let now = Instant::now();

        protocol.on_message(Ipv4Addr::new(10, 0, 0, 1), announce(host(&[(1, [10, 0, 0, 1])])), now);
        assert_eq!(protocol.links().get_cloned(&key()).unwrap().paths.len(), 1);

        let later = now + Duration::from_secs(5);
        protocol.on_message(Ipv4Addr::new(10, 0, 0, 1), announce(receiver()), later);

        let link = protocol.links().get_cloned(&key()).unwrap();
        assert_eq!(link.inds, PathBitmap(0b0110));
        assert_eq!(link.paths.iter().map(|p| p.ind).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(protocol.links().last_seen(&key()), Some(later));
        // the flow identity survives a refresh
        assert_eq!(link.flow_id.reboot_counter(), 7);
    }

    #[test]
    fn test_recreated_link_gets_new_flow_identity() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let mut supervisor = MockSupervisor::new();
        supervisor.expect_start_duplicator()
            .times(2)
            .return_const(());
        supervisor.expect_stop_duplicator()
            .with(eq(key()))
            .times(1)
            .return_const(());

        let protocol = protocol(host(&[(1, [10, 0, 0, 9])]), supervisor, false);
        let now = Instant::now();
        protocol.on_message(Ipv4Addr::new(10, 0, 0, 1), announce(receiver()), now);

        for (key, _) in protocol.links().sweep(now + Duration::from_secs(61)) {
            protocol.on_link_expired(key);
        }
        assert!(protocol.links().is_empty());

        protocol.on_message(Ipv4Addr::new(10, 0, 0, 1), announce(receiver()), now + Duration::from_secs(62));
        assert_eq!(protocol.links().get_cloned(&key()).unwrap().flow_id.reboot_counter(), 8);
    }

    #[test]
    fn test_acknowledge_reply() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let mut supervisor = MockSupervisor::new();
        supervisor.expect_start_duplicator().return_const(());

        let local = host(&[(1, [10, 0, 0, 9])]);
        let protocol = protocol(local.clone(), supervisor, true);
        let reply = protocol.on_message(Ipv4Addr::new(10, 0, 0, 1), announce(receiver()), Instant::now());

        assert_eq!(reply, Some((
            SocketAddr::from(([10, 0, 0, 1], 1000)),
            ControlMessage::Acknowledge(AcknowledgeData {
                host: local,
                group_addr: Ipv4Addr::new(10, 0, 0, 1),
                sender_addr: Ipv4Addr::new(10, 0, 0, 9),
            }),
        )));
    }

    #[test]
    fn test_on_acknowledge() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let protocol = protocol(receiver(), MockSupervisor::new(), true);
        let ack = ControlMessage::Acknowledge(AcknowledgeData {
            host: host(&[(2, [10, 0, 1, 9]), (5, [10, 5, 0, 9])]),
            group_addr: Ipv4Addr::new(239, 0, 0, 1),
            sender_addr: Ipv4Addr::new(10, 0, 1, 9),
        });

        assert!(protocol.on_message(Ipv4Addr::new(10, 0, 1, 9), ack, Instant::now()).is_none());

        let key = SenderKey { group_addr: Ipv4Addr::new(239, 0, 0, 1), sender_addr: Ipv4Addr::new(10, 0, 1, 9) };
        let interfaces = protocol.sender_interfaces.get_cloned(&key).unwrap();
        assert_eq!(interfaces.interfaces, vec![
            (Interface { ind: 2, addr: Ipv4Addr::new(10, 0, 1, 9) }, Ipv4Addr::new(10, 0, 0, 2)),
        ]);
    }

    #[test]
    fn test_announcements() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let protocol = protocol(receiver(), MockSupervisor::new(), true);
        let observed = ObservedSender {
            src_addr: Ipv4Addr::new(10, 0, 0, 9),
            dest_addr: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 4000,
            dest_port: 5000,
            iprp_capable: false,
        };

        let announcements = protocol.announcements(&[observed]);
        assert_eq!(announcements, vec![(SocketAddr::from(([10, 0, 0, 9], 1000)), announce(receiver()))]);
    }
}
