pub mod config;
pub mod control;
pub mod data;
pub mod flow_id;
pub mod host;
pub mod node;
pub mod registry;
pub mod test_util;
pub mod util;
pub mod verdict;
pub mod wire;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
