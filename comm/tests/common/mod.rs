//! Shared plumbing for the integration tests.

use {
    plexus_comm::{cluster::ClusterState, config::CommConfig},
    std::{
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// A cluster suitable for single-process tests: loopback, no listener,
/// port fixed so Host statements can name the local machine.
pub fn local_cluster(port: u16) -> Arc<ClusterState> {
    init_logging();
    let cluster = ClusterState::new(CommConfig::dev_default());
    cluster.set_listen_port(port);
    cluster
}

/// A cluster with a live listener on an ephemeral port.
pub fn listening_cluster() -> Arc<ClusterState> {
    init_logging();
    let cluster = ClusterState::new(CommConfig::dev_default());
    plexus_comm::server::start(&cluster, None).unwrap();
    cluster
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
