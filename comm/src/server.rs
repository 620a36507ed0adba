//! Listener: accept inbound connections and hand them to the peer layer.

use {
    crate::{
        cluster::ClusterState,
        connection::Connection,
        error::{CommError, Result},
        peer::{ChannelKind, Peer},
    },
    log::{info, warn},
    std::{
        net::TcpListener,
        sync::Arc,
        thread::{Builder, JoinHandle},
    },
};

/// Bind the listener and start the accept loop.
///
/// With `forced_port` the bind either succeeds there or fails; otherwise
/// the configured port and its scan range are tried in order. The bound
/// port is recorded in the cluster state before this returns, so Host
/// matching sees the real value.
pub fn start(cluster: &Arc<ClusterState>, forced_port: Option<u16>) -> Result<JoinHandle<()>> {
    let config = cluster.config();
    let listener = match forced_port {
        Some(port) => TcpListener::bind((config.bind_ip.as_str(), port))?,
        None => bind_scanning(&config.bind_ip, config.listen_port, config.port_scan_range)?,
    };
    let port = listener.local_addr()?.port();
    cluster.set_listen_port(port);
    info!("listening on {}:{port}", config.bind_ip);

    let cluster = Arc::clone(cluster);
    let handle = Builder::new()
        .name("plexusAccept".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                let conn = match stream.map_err(CommError::Io).and_then(Connection::from_stream)
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                info!("inbound connection from {}", conn.addr());
                let peer = Peer::accept(conn, ChannelKind::Command);
                cluster.add_peer(Arc::clone(&peer));
                if let Err(e) = peer.spawn_reader(Arc::clone(&cluster)) {
                    warn!("reader for {} failed to start: {e}", peer.addr());
                    cluster.remove_peer(&peer);
                }
            }
        })?;
    Ok(handle)
}

/// Try `base`, then the next `range` ports, first bind wins.
fn bind_scanning(ip: &str, base: u16, range: u16) -> Result<TcpListener> {
    let mut last_err = None;
    for offset in 0..=range {
        let port = base.saturating_add(offset);
        match TcpListener::bind((ip, port)) {
            Ok(listener) => {
                if offset > 0 {
                    info!("port {base} taken, using {port}");
                }
                return Ok(listener);
            }
            Err(e) => last_err = Some(e),
        }
        // Port 0 means an ephemeral bind; no point scanning from it.
        if base == 0 {
            break;
        }
    }
    Err(last_err.map(CommError::Io).unwrap_or(CommError::ConnectionClosed))
}
