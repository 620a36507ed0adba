//! plexusd: the plexus cluster daemon.
//!
//! Starts the listener (scanning for a free port unless one is forced),
//! optionally joins an existing network through a bootstrap address,
//! optionally loads and broadcasts an initial topology model, then runs
//! until the last scheduler winds down or an `exit` command arrives.

use {
    clap::{crate_version, App, Arg},
    log::{error, info, warn},
    plexus_comm::{cluster::ClusterState, config::CommConfig, node::NodeLogic, server},
    std::process::exit,
};

/// Built-in no-op node type, handy for smoke-testing a deployment before
/// an embedding application registers real types.
struct Idle;

impl NodeLogic for Idle {}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = App::new("plexusd")
        .about("plexus cluster daemon")
        .version(crate_version!())
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .takes_value(true)
                .help("Listen on exactly this port instead of scanning for a free one"),
        )
        .arg(
            Arg::with_name("model")
                .long("model")
                .value_name("FILE")
                .takes_value(true)
                .help("Topology description to load and broadcast at startup"),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("IP")
                .takes_value(true)
                .help("Address the listener binds on (default 0.0.0.0)"),
        )
        .arg(
            Arg::with_name("advertise")
                .long("advertise")
                .value_name("IP")
                .takes_value(true)
                .help(
                    "Address peers dial back on and Host declarations are matched \
                     against (default 127.0.0.1)",
                ),
        )
        .arg(
            Arg::with_name("bootstrap")
                .value_name("BOOTSTRAP")
                .index(1)
                .help("Address of a running daemon to join"),
        )
        .get_matches();

    let forced_port = matches.value_of("port").map(|p| match p.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            error!("bad port: {p}");
            exit(1);
        }
    });

    let config = net_config(matches.value_of("bind"), matches.value_of("advertise"));
    let cluster = ClusterState::new(config);
    cluster.registry().register("idle", || Box::new(Idle));

    if let Err(e) = server::start(&cluster, forced_port) {
        error!("cannot start listener: {e}");
        exit(1);
    }

    if let Some(bootstrap) = matches.value_of("bootstrap") {
        if let Err(e) = cluster.enter_network(bootstrap) {
            // Keep running; an operator can retry with the enter command.
            warn!("joining {bootstrap} failed: {e}");
        }
    }

    if let Some(path) = matches.value_of("model") {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                if let Err(e) = cluster.load_model(&text) {
                    warn!("loading model {path} failed: {e}");
                }
            }
            Err(e) => warn!("cannot read model {path}: {e}"),
        }
    }

    info!("plexusd up on port {}", cluster.listen_port());
    cluster.wait_shutdown();
    info!("plexusd exiting");
}

/// Defaults with the listener and advertised addresses overridden from
/// the command line. The advertised address is what Host declarations in
/// a model are matched against to find the local machine.
fn net_config(bind: Option<&str>, advertise: Option<&str>) -> CommConfig {
    let mut config = CommConfig::default();
    if let Some(ip) = bind {
        config.bind_ip = ip.to_string();
    }
    if let Some(ip) = advertise {
        config.advertised_ip = ip.to_string();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_config_overrides() {
        let config = net_config(None, None);
        assert_eq!(config.bind_ip, "0.0.0.0");
        assert_eq!(config.advertised_ip, "127.0.0.1");

        let config = net_config(Some("10.0.0.5"), Some("10.0.0.5"));
        assert_eq!(config.bind_ip, "10.0.0.5");
        assert_eq!(config.advertised_ip, "10.0.0.5");
    }
}
