//! Configuration for a plexus process.

/// Configuration shared by the daemon, the peer layer and the schedulers.
///
/// Controls listener placement, dial behavior and frame limits for
/// machine-to-machine gossip traffic.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Port the daemon tries to listen on first.
    /// Default: `10001`.
    pub listen_port: u16,

    /// How many consecutive ports to try when `listen_port` is taken.
    /// Ignored when the port is forced on the command line.
    pub port_scan_range: u16,

    /// Address the listener binds on.
    pub bind_ip: String,

    /// Address advertised to peers when subscribing; peers dial back on
    /// `advertised_ip:listen_port`.
    pub advertised_ip: String,

    /// Number of dial attempts before giving up on an outbound connection.
    pub connect_attempts: u32,

    /// Delay between dial attempts (ms).
    pub connect_retry_ms: u64,

    /// Maximum size of one decoded frame part in bytes.
    /// Gossip payloads are typically small; snapshots can reach megabytes.
    pub max_frame_size: usize,

    /// Scheduler threads created when a Host declaration does not name a
    /// thread count.
    pub default_threads: usize,

    /// Interval between telemetry pushes from slaves to root (ms).
    pub infos_interval_ms: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            listen_port: 10001,
            port_scan_range: 100,
            bind_ip: "0.0.0.0".to_string(),
            advertised_ip: "127.0.0.1".to_string(),
            connect_attempts: 10,
            connect_retry_ms: 1_000,
            max_frame_size: 64 * 1024 * 1024,
            default_threads: 1,
            infos_interval_ms: 1_000,
        }
    }
}

impl CommConfig {
    /// Create a config suitable for local testing: loopback only, ephemeral
    /// listener port, fast dial failure.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            listen_port: 0,
            port_scan_range: 0,
            bind_ip: "127.0.0.1".to_string(),
            advertised_ip: "127.0.0.1".to_string(),
            connect_attempts: 1,
            connect_retry_ms: 50,
            max_frame_size: 4 * 1024 * 1024,
            default_threads: 1,
            infos_interval_ms: 100,
        }
    }
}
