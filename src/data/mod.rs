pub mod dedup;
pub mod duplicator;
pub mod monitor;
pub mod transport;
