use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::control::peer_link::{LinkKey, PeerLink};
use crate::data::duplicator::Duplicator;
use crate::data::transport::PathSender;
use crate::registry::expiring_registry::ExpiringRegistry;

/// Lifecycle of the data plane instances that serve a peer link. The control protocol requests
///  a duplicator when it creates a link and releases it when the link expires.
///
/// Implementations may delegate to a different process; the control protocol does not wait for
///  the request to take effect.
#[cfg_attr(test, mockall::automock)]
pub trait Supervisor: Send + Sync {
    fn start_duplicator(&self, key: LinkKey);
    fn stop_duplicator(&self, key: LinkKey);
}

/// In-process [Supervisor] that keeps at most one [Duplicator] per peer link
pub struct Duplicators {
    links: Arc<ExpiringRegistry<LinkKey, PeerLink>>,
    sender: Arc<dyn PathSender>,
    data_port: u16,
    active: Mutex<FxHashMap<LinkKey, Arc<Duplicator>>>,
}

impl Duplicators {
    pub fn new(links: Arc<ExpiringRegistry<LinkKey, PeerLink>>, sender: Arc<dyn PathSender>, data_port: u16) -> Duplicators {
        Duplicators {
            links,
            sender,
            data_port,
            active: Default::default(),
        }
    }

    fn active(&self) -> MutexGuard<'_, FxHashMap<LinkKey, Arc<Duplicator>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &LinkKey) -> Option<Arc<Duplicator>> {
        self.active().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Supervisor for Duplicators {
    fn start_duplicator(&self, key: LinkKey) {
        let mut active = self.active();
        if active.contains_key(&key) {
            debug!(?key, "duplicator is already running");
            return;
        }

        info!(?key, "starting duplicator");
        active.insert(key, Arc::new(Duplicator::new(key, self.links.clone(), self.sender.clone(), self.data_port)));
    }

    fn stop_duplicator(&self, key: LinkKey) {
        if self.active().remove(&key).is_some() {
            info!(?key, "stopped duplicator");
        }
    }
}
