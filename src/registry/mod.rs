pub mod expiring_registry;
pub mod snapshot;
