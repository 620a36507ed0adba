//! Plexus runtime substrate.
//!
//! A plexus cluster is a set of daemons hosting *nodes*: small stateful
//! actors grouped into named populations, wired by a declarative
//! topology, scheduled cooperatively and messaged over gossip-style
//! links. This crate provides the whole substrate:
//!
//! - [`wire`]: the framed message codec shared by every channel.
//! - [`connection`] / [`peer`]: blocking TCP transport and the per-peer
//!   reader threads.
//! - [`commands`]: the numbered system-command table and dispatcher.
//! - [`cluster`]: process-wide shared state, membership and bootstrap.
//! - [`topology`]: groups, links, placements and the description parser.
//! - [`scheduler`] / [`node`] / [`registry`]: cooperative execution of
//!   registered node types.
//! - [`telemetry`]: counters and the cluster introspection snapshots.
//!
//! A daemon embeds the substrate like this:
//!
//! ```no_run
//! use plexus_comm::{cluster::ClusterState, config::CommConfig, server};
//!
//! let cluster = ClusterState::new(CommConfig::default());
//! cluster.registry().register("idle", || {
//!     struct Idle;
//!     impl plexus_comm::node::NodeLogic for Idle {}
//!     Box::new(Idle)
//! });
//! let _listener = server::start(&cluster, None).unwrap();
//! cluster.wait_shutdown();
//! ```

pub mod client;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod machine;
pub mod node;
pub mod peer;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod topology;
pub mod wire;

pub use {
    cluster::ClusterState,
    config::CommConfig,
    error::{CommError, Result},
    node::{NodeCtx, NodeLogic, NodeStatus},
    wire::Message,
};
