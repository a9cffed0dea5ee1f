use std::future::pending;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::IprpConfig;
use crate::control::control_logic::ControlProtocol;
use crate::control::peer_link::{LinkKey, PeerLink, SenderInterfaces, SenderKey};
use crate::control::run_control;
use crate::control::supervisor::Duplicators;
use crate::data::dedup::{DedupEngine, ReceiverFlow};
use crate::data::duplicator::OutboundHandler;
use crate::data::monitor::{MonitorHandler, ObservedKey, ObservedSender, SenderMonitor};
use crate::data::transport::PathSender;
use crate::flow_id::FlowIdentity;
use crate::registry::expiring_registry::{run_sweep_loop, ExpiringRegistry};
use crate::registry::snapshot::SnapshotStore;
use crate::util::random::{Random, RngRandom};
use crate::verdict::{run_packet_loop, PacketSource};

/// The interception queues a node takes packets from
pub struct PacketSources {
    /// outgoing datagrams of local applications
    pub outbound: Arc<dyn PacketSource>,
    /// encapsulated copies arriving at the data port
    pub inbound: Arc<dyn PacketSource>,
    /// incoming datagrams to monitored ports
    pub monitor: Arc<dyn PacketSource>,
    /// Reconstructed datagrams coming out of dedup. Only needed if dedup requeues rather than
    ///  notifying the monitor in-process.
    pub monitor_via_dedup: Option<Arc<dyn PacketSource>>,
}

/// All of a host's protocol state and components, wired together
pub struct IprpNode<R: Random = RngRandom> {
    config: Arc<IprpConfig>,
    peer_links: Arc<ExpiringRegistry<LinkKey, PeerLink>>,
    sender_interfaces: Arc<ExpiringRegistry<SenderKey, SenderInterfaces>>,
    receiver_flows: Arc<ExpiringRegistry<FlowIdentity, ReceiverFlow>>,
    observed_senders: Arc<ExpiringRegistry<ObservedKey, ObservedSender>>,
    duplicators: Arc<Duplicators>,
    protocol: Arc<ControlProtocol<R>>,
    dedup: Arc<DedupEngine>,
    monitor: Arc<SenderMonitor>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl <R: Random> IprpNode<R> {
    pub fn new(config: IprpConfig, path_sender: Arc<dyn PathSender>, snapshot_store: Option<Arc<dyn SnapshotStore>>) -> anyhow::Result<IprpNode<R>> {
        config.validate()?;
        let config = Arc::new(config);

        let peer_links = Arc::new(ExpiringRegistry::new("peer-links", config.peer_link_ttl));
        let sender_interfaces = Arc::new(ExpiringRegistry::new("sender-interfaces", config.sender_interfaces_ttl));
        let receiver_flows = Arc::new(ExpiringRegistry::new("receiver-flows", config.receiver_flow_ttl));
        let observed_senders = Arc::new(ExpiringRegistry::new("observed-senders", config.observed_sender_ttl));

        let duplicators = Arc::new(Duplicators::new(peer_links.clone(), path_sender, config.data_port));
        let protocol = Arc::new(ControlProtocol::new(config.clone(), peer_links.clone(), sender_interfaces.clone(), duplicators.clone()));
        let monitor = Arc::new(SenderMonitor::new(observed_senders.clone(), vec![config.control_port, config.data_port]));
        let dedup = Arc::new(DedupEngine::new(receiver_flows.clone(), Some(monitor.clone()), config.dedup_requeue_target));

        Ok(IprpNode {
            config,
            peer_links,
            sender_interfaces,
            receiver_flows,
            observed_senders,
            duplicators,
            protocol,
            dedup,
            monitor,
            snapshot_store,
        })
    }

    pub fn config(&self) -> &Arc<IprpConfig> {
        &self.config
    }

    pub fn protocol(&self) -> &Arc<ControlProtocol<R>> {
        &self.protocol
    }

    pub fn duplicators(&self) -> &Arc<Duplicators> {
        &self.duplicators
    }

    pub fn dedup(&self) -> &Arc<DedupEngine> {
        &self.dedup
    }

    pub fn monitor(&self) -> &Arc<SenderMonitor> {
        &self.monitor
    }

    /// Runs the node until one of its packet sources fails. Failing to bind the control socket is
    ///  reported as an error before anything else is started.
    pub async fn run(&self, sources: PacketSources) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.control_port)).await?);
        self.restore_snapshots().await;

        let protocol = self.protocol.clone();
        let on_link_expired = move |key: LinkKey, _: PeerLink| protocol.on_link_expired(key);

        info!("starting iPRP node with interfaces {:?}", self.config.host.bitmap());

        select! {
            r = run_control(self.config.clone(), socket, self.protocol.clone(), self.monitor.clone()) => r,
            _ = run_sweep_loop(self.peer_links.clone(), self.config.peer_link_sweep_interval, on_link_expired) => Ok(()),
            _ = run_sweep_loop(self.sender_interfaces.clone(), self.config.sender_interfaces_sweep_interval, |key, _| debug!(?key, "sender interfaces expired")) => Ok(()),
            _ = run_sweep_loop(self.receiver_flows.clone(), self.config.receiver_flow_sweep_interval, |flow_id, _| debug!(?flow_id, "receiver flow expired")) => Ok(()),
            _ = run_sweep_loop(self.observed_senders.clone(), self.config.observed_sender_sweep_interval, |key, _| debug!(?key, "observed sender expired")) => Ok(()),
            _ = self.publish_snapshots() => Ok(()),
            r = run_packet_loop("outbound", sources.outbound, Arc::new(OutboundHandler::new(self.duplicators.clone(), self.config.control_port, self.config.data_port))) => r,
            r = run_packet_loop("dedup", sources.inbound, self.dedup.clone()) => r,
            r = run_packet_loop("monitor", sources.monitor, Arc::new(MonitorHandler::new(self.monitor.clone(), false))) => r,
            r = self.run_monitor_via_dedup(sources.monitor_via_dedup) => r,
        }
    }

    async fn run_monitor_via_dedup(&self, source: Option<Arc<dyn PacketSource>>) -> anyhow::Result<()> {
        match source {
            Some(source) => run_packet_loop("monitor-via-dedup", source, Arc::new(MonitorHandler::new(self.monitor.clone(), true))).await,
            None => pending().await,
        }
    }

    /// Observed senders survive a restart through their snapshot, so traffic from iPRP capable
    ///  senders does not reach applications twice while links are re-established. The interfaces
    ///  learned from Acknowledge messages are restored along with them.
    async fn restore_snapshots(&self) {
        let Some(store) = &self.snapshot_store else {
            return;
        };
        match self.observed_senders.load_snapshot(store.as_ref(), Instant::now()).await {
            Ok(n) => info!("restored {} observed senders from snapshot", n),
            Err(e) => warn!("error loading observed senders snapshot: {}", e),
        }
        match self.sender_interfaces.load_snapshot(store.as_ref(), Instant::now()).await {
            Ok(n) => info!("restored interfaces of {} senders from snapshot", n),
            Err(e) => warn!("error loading sender interfaces snapshot: {}", e),
        }
    }

    pub fn sender_interfaces(&self) -> &Arc<ExpiringRegistry<SenderKey, SenderInterfaces>> {
        &self.sender_interfaces
    }

    async fn publish_snapshots(&self) {
        let Some(store) = &self.snapshot_store else {
            return pending().await;
        };

        let mut ticks = interval(self.config.snapshot_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if let Err(e) = self.peer_links.write_snapshot(store.as_ref()).await {
                warn!("error writing peer link snapshot: {}", e);
            }
            if let Err(e) = self.observed_senders.write_snapshot(store.as_ref()).await {
                warn!("error writing observed senders snapshot: {}", e);
            }
            if let Err(e) = self.sender_interfaces.write_snapshot(store.as_ref()).await {
                warn!("error writing sender interfaces snapshot: {}", e);
            }
        }
    }
}
