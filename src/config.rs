use std::time::Duration;

use anyhow::bail;

use crate::host::HostDescriptor;

#[derive(Debug, Clone)]
pub struct IprpConfig {
    /// the local interfaces that take part in redundant delivery
    pub host: HostDescriptor,

    pub control_port: u16,
    /// all encapsulated copies are sent to this port on the receiving host
    pub data_port: u16,

    /// base interval between two rounds of Announce messages
    pub announce_interval: Duration,
    /// The random extra delay on top of [IprpConfig::announce_interval] is `(1 - X) * scale`
    ///  where X is exponentially distributed with rate [IprpConfig::announce_backoff_lambda].
    pub announce_backoff_scale: Duration,
    pub announce_backoff_lambda: f64,

    /// a peer link is dropped after this time without an Announce
    pub peer_link_ttl: Duration,
    pub peer_link_sweep_interval: Duration,

    pub receiver_flow_ttl: Duration,
    pub receiver_flow_sweep_interval: Duration,

    pub observed_sender_ttl: Duration,
    pub observed_sender_sweep_interval: Duration,

    pub sender_interfaces_ttl: Duration,
    pub sender_interfaces_sweep_interval: Duration,

    /// interval for publishing the peer link registry to the snapshot store
    pub snapshot_interval: Duration,

    /// reply to each Announce with an Acknowledge carrying the local interfaces
    pub send_acknowledge: bool,

    /// If set, fresh packets are handed to this queue instead of being reinjected in place
    pub dedup_requeue_target: Option<u16>,
}

impl IprpConfig {
    pub fn new(host: HostDescriptor) -> IprpConfig {
        IprpConfig {
            host,
            control_port: 1000,
            data_port: 1001,
            announce_interval: Duration::from_secs(3),
            announce_backoff_scale: Duration::from_secs(10),
            announce_backoff_lambda: 2.5,
            peer_link_ttl: Duration::from_secs(60),
            peer_link_sweep_interval: Duration::from_secs(3),
            receiver_flow_ttl: Duration::from_secs(120),
            receiver_flow_sweep_interval: Duration::from_secs(5),
            observed_sender_ttl: Duration::from_secs(60),
            observed_sender_sweep_interval: Duration::from_secs(10),
            sender_interfaces_ttl: Duration::from_secs(60),
            sender_interfaces_sweep_interval: Duration::from_secs(3),
            snapshot_interval: Duration::from_secs(3),
            send_acknowledge: true,
            dedup_requeue_target: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            bail!("at least one interface is required");
        }
        if self.control_port == 0 || self.data_port == 0 {
            bail!("control and data port must be configured");
        }
        if self.control_port == self.data_port {
            bail!("control port and data port must differ");
        }
        if !(self.announce_backoff_lambda > 0.0) {
            bail!("announce backoff lambda must be positive");
        }

        for (name, interval) in [
            ("announce interval", self.announce_interval),
            ("peer link sweep interval", self.peer_link_sweep_interval),
            ("receiver flow sweep interval", self.receiver_flow_sweep_interval),
            ("observed sender sweep interval", self.observed_sender_sweep_interval),
            ("sender interfaces sweep interval", self.sender_interfaces_sweep_interval),
            ("snapshot interval", self.snapshot_interval),
        ] {
            if interval.is_zero() {
                bail!("{} must not be zero", name);
            }
        }

        // the backoff adds at most its scale to each announce interval
        if self.peer_link_ttl <= self.announce_interval + self.announce_backoff_scale {
            bail!("peer link TTL must be longer than the maximum delay between Announce messages");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use rstest::rstest;
    use super::*;

    fn config() -> IprpConfig {
        IprpConfig::new(HostDescriptor::new([(1, Ipv4Addr::new(10, 0, 0, 1))]).unwrap())
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_ttl_just_above_max_delay() {
        let mut config = config();
        config.peer_link_ttl = config.announce_interval + config.announce_backoff_scale + Duration::from_millis(1);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::no_interfaces(|c: &mut IprpConfig| c.host = HostDescriptor::default())]
    #[case::same_ports(|c: &mut IprpConfig| c.data_port = c.control_port)]
    #[case::zero_port(|c: &mut IprpConfig| c.control_port = 0)]
    #[case::zero_lambda(|c: &mut IprpConfig| c.announce_backoff_lambda = 0.0)]
    #[case::nan_lambda(|c: &mut IprpConfig| c.announce_backoff_lambda = f64::NAN)]
    #[case::zero_sweep(|c: &mut IprpConfig| c.receiver_flow_sweep_interval = Duration::ZERO)]
    #[case::ttl_too_short(|c: &mut IprpConfig| c.peer_link_ttl = Duration::from_secs(1))]
    #[case::ttl_within_backoff(|c: &mut IprpConfig| c.peer_link_ttl = Duration::from_secs(12))]
    #[case::ttl_equals_max_delay(|c: &mut IprpConfig| c.peer_link_ttl = c.announce_interval + c.announce_backoff_scale)]
    fn test_validate_rejects(#[case] modify: fn(&mut IprpConfig)) {
        let mut config = config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
