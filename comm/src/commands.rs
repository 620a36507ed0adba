//! System command table and dispatcher.
//!
//! Commands travel as frames with `src == -1`; the channel field carries
//! the command id, which is the command's index in [`COMMANDS`]. Call
//! sites resolve names to ids once; the wire only ever sees numbers, so
//! the table order is part of the protocol.

use {
    crate::{
        cluster::ClusterState,
        error::{CommError, Result},
        node::NodeCtx,
        peer::Peer,
        wire::Message,
    },
    log::{error, info, warn},
    std::sync::Arc,
};

type Handler = fn(&Arc<ClusterState>, &Arc<Peer>, &mut Message) -> Result<()>;

/// One entry of the command table.
pub struct CommandSpec {
    pub name: &'static str,
    handler: Handler,
}

/// The protocol's command surface. Index == wire id; append only.
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "add_to_network", handler: cmd_add_to_network },
    CommandSpec { name: "dump", handler: cmd_dump },
    CommandSpec { name: "echo", handler: cmd_echo },
    CommandSpec { name: "enter", handler: cmd_enter },
    CommandSpec { name: "exit", handler: cmd_exit },
    CommandSpec { name: "leave", handler: cmd_leave },
    CommandSpec { name: "localdump", handler: cmd_localdump },
    CommandSpec { name: "notify_subscription", handler: cmd_notify_subscription },
    CommandSpec { name: "root_welcome", handler: cmd_root_welcome },
    CommandSpec { name: "set_topology", handler: cmd_set_topology },
    CommandSpec { name: "shell", handler: cmd_shell },
    CommandSpec { name: "subscribe", handler: cmd_subscribe },
    CommandSpec { name: "model", handler: cmd_model },
    CommandSpec { name: "start_infos", handler: cmd_start_infos },
    CommandSpec { name: "do_start_infos", handler: cmd_do_start_infos },
    CommandSpec { name: "data_host", handler: cmd_data_host },
    CommandSpec { name: "update_infos", handler: cmd_update_infos },
    CommandSpec { name: "infos", handler: cmd_infos },
    CommandSpec { name: "infos_reply", handler: cmd_infos_reply },
    CommandSpec { name: "node_request", handler: cmd_node_request },
];

/// Wire id of a command name.
pub fn command_id(name: &str) -> Result<i32> {
    COMMANDS
        .iter()
        .position(|c| c.name == name)
        .map(|i| i as i32)
        .ok_or_else(|| CommError::UnknownCommand(name.to_string()))
}

/// Command name for a wire id.
pub fn command_name(id: i32) -> Option<&'static str> {
    usize::try_from(id)
        .ok()
        .and_then(|i| COMMANDS.get(i))
        .map(|c| c.name)
}

/// Run one inbound command on the caller's thread. Unknown ids and
/// handler failures are logged; neither kills the connection.
pub fn dispatch(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, mut msg: Message) {
    let Some(spec) = usize::try_from(msg.channel).ok().and_then(|i| COMMANDS.get(i)) else {
        error!("{}", CommError::UnknownCommandId(msg.channel));
        return;
    };
    msg.rewind();
    if let Err(e) = (spec.handler)(cluster, peer, &mut msg) {
        warn!("command {} from {} failed: {e}", spec.name, peer.addr());
    }
}

/// Swap the port of an `ip:port` address string.
fn replace_port(addr: &str, port: u16) -> String {
    let host = addr.rsplit_once(':').map_or(addr, |(h, _)| h);
    format!("{host}:{port}")
}

// ── Handlers ────────────────────────────────────────────────────────────────

fn cmd_add_to_network(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let addr = msg.next_str()?.to_string();
    cluster.invite(&addr)
}

fn cmd_dump(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, _msg: &mut Message) -> Result<()> {
    peer.send_command("infos_reply", cluster.dump_peers().as_bytes())
}

fn cmd_echo(_cluster: &Arc<ClusterState>, peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    info!("echo from {}: {}", peer.addr(), msg.next_str()?);
    Ok(())
}

fn cmd_enter(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let addr = msg.next_str()?.to_string();
    cluster.enter_network(&addr)
}

fn cmd_exit(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, _msg: &mut Message) -> Result<()> {
    info!("exit requested");
    for slave in cluster.slaves() {
        if let Err(e) = slave.send_command("exit", b"") {
            warn!("propagating exit to {} failed: {e}", slave.addr());
        }
    }
    cluster.request_exit();
    Ok(())
}

fn cmd_leave(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, _msg: &mut Message) -> Result<()> {
    info!("{} left the network", peer.addr());
    cluster.remove_peer(peer);
    peer.shutdown();
    Ok(())
}

fn cmd_localdump(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, _msg: &mut Message) -> Result<()> {
    info!("membership:\n{}", cluster.dump_peers());
    Ok(())
}

/// A subscription seen somewhere below us. Relay root-ward; the root
/// itself dials the joiner and welcomes it.
fn cmd_notify_subscription(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let addr = msg.next_str()?.to_string();
    if cluster.is_root() {
        cluster.invite(&addr)
    } else {
        forward_to_master(cluster, "notify_subscription", addr.as_bytes())
    }
}

/// The network's root speaks to us over this connection.
fn cmd_root_welcome(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let port: u16 = msg
        .next_str()?
        .trim()
        .parse()
        .map_err(|_| CommError::InvalidReply("bad root port".to_string()))?;
    peer.set_addr(replace_port(&peer.addr(), port));
    cluster.add_master(peer);
    cluster.set_root(peer);
    info!("root is {}", peer.addr());
    Ok(())
}

fn cmd_set_topology(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let text = msg.next_str()?.to_string();
    cluster.flood_topology(&text)
}

fn cmd_shell(_cluster: &Arc<ClusterState>, peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let line = msg.next_str()?.to_string();
    info!("shell from {}: {line}", peer.addr());
    let output = std::process::Command::new("sh").arg("-c").arg(&line).output()?;
    if !output.stdout.is_empty() {
        info!("shell stdout: {}", String::from_utf8_lossy(&output.stdout).trim_end());
    }
    if !output.stderr.is_empty() {
        warn!("shell stderr: {}", String::from_utf8_lossy(&output.stderr).trim_end());
    }
    Ok(())
}

/// A joiner announces the port its own listener is on. It becomes our
/// slave; if we are not the root, the root learns about it and dials it
/// back directly.
fn cmd_subscribe(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let port: u16 = msg
        .next_str()?
        .trim()
        .parse()
        .map_err(|_| CommError::InvalidReply("bad subscriber port".to_string()))?;
    peer.set_addr(replace_port(&peer.addr(), port));
    cluster.add_slave(peer);
    info!("{} subscribed", peer.addr());
    if cluster.is_root() {
        peer.send_command("root_welcome", cluster.listen_port().to_string().as_bytes())
    } else {
        forward_to_master(cluster, "notify_subscription", peer.addr().as_bytes())
    }
}

/// Full model load: make sure every machine the description names is in
/// the network, then broadcast the description.
fn cmd_model(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let text = msg.next_str()?.to_string();
    cluster.load_model(&text)
}

fn cmd_start_infos(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, _msg: &mut Message) -> Result<()> {
    if cluster.is_root() {
        cluster.start_infos_updater();
        for slave in cluster.slaves() {
            if let Err(e) = slave.send_command("do_start_infos", b"") {
                warn!("do_start_infos to {} failed: {e}", slave.addr());
            }
        }
        Ok(())
    } else {
        forward_to_master(cluster, "start_infos", b"")
    }
}

fn cmd_do_start_infos(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, _msg: &mut Message) -> Result<()> {
    cluster.start_infos_updater();
    Ok(())
}

/// The remote end of a data channel tells us which machine it is.
fn cmd_data_host(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let name = msg.next_str()?.to_string();
    peer.set_kind(crate::peer::ChannelKind::Data);
    cluster.machines().attach_data_peer(&name, Arc::clone(peer))
}

fn cmd_update_infos(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let json = msg.next_str()?;
    let snapshot = serde_json::from_str(json)
        .map_err(|e| CommError::InvalidReply(format!("bad snapshot: {e}")))?;
    cluster.update_shadow(snapshot);
    Ok(())
}

/// Cluster snapshot request. The root answers directly; everyone else
/// parks the requester and asks the root, answering when the root's
/// `infos_reply` comes back.
fn cmd_infos(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, _msg: &mut Message) -> Result<()> {
    cluster.sample_now();
    if cluster.is_root() {
        let json = serde_json::to_string_pretty(&cluster.cluster_snapshot())
            .map_err(|e| CommError::InvalidReply(e.to_string()))?;
        peer.send_command("infos_reply", json.as_bytes())
    } else if let Some(root) = cluster.root() {
        cluster.push_pending_infos(peer);
        root.send_command("infos", b"")
    } else {
        let json = serde_json::to_string_pretty(&cluster.local_snapshot())
            .map_err(|e| CommError::InvalidReply(e.to_string()))?;
        peer.send_command("infos_reply", json.as_bytes())
    }
}

fn cmd_infos_reply(cluster: &Arc<ClusterState>, _peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let text = msg.next_str()?.to_string();
    let requesters = cluster.take_pending_infos();
    if requesters.is_empty() {
        info!("infos:\n{text}");
        return Ok(());
    }
    for requester in requesters {
        if let Err(e) = requester.send_command("infos_reply", text.as_bytes()) {
            warn!("relaying infos to {} failed: {e}", requester.addr());
        }
    }
    Ok(())
}

/// Operator query against one resident node: `group@machine[idx] what`.
fn cmd_node_request(cluster: &Arc<ClusterState>, peer: &Arc<Peer>, msg: &mut Message) -> Result<()> {
    let line = msg.next_str()?.to_string();
    let reply = match answer_node_request(cluster, &line) {
        Ok(text) => text,
        Err(e) => format!("error: {e}"),
    };
    peer.send_command("infos_reply", reply.as_bytes())
}

fn answer_node_request(cluster: &Arc<ClusterState>, line: &str) -> Result<String> {
    let (target, what) = line
        .split_once(char::is_whitespace)
        .map(|(t, w)| (t, w.trim()))
        .unwrap_or((line.trim(), ""));
    let parsed = (|| {
        let (group, rest) = target.split_once('@')?;
        let (machine, rest) = rest.split_once('[')?;
        let index = rest.strip_suffix(']')?.trim().parse::<u64>().ok()?;
        Some((group.trim(), machine.trim(), index))
    })();
    let Some((group_name, machine, index)) = parsed else {
        return Err(CommError::InvalidReply(format!(
            "node request wants group@machine[idx], got {target}"
        )));
    };
    if cluster.local_machine().as_deref() != Some(machine) {
        return Err(CommError::UnknownMachine(format!("{machine} is not this machine")));
    }
    let topology = cluster.topology().ok_or(CommError::NoTopology)?;
    let group = topology.group_by_name(group_name)?;
    let cell = group
        .local_cell(index)
        .ok_or_else(|| CommError::NodeIndexOverflow {
            group: group_name.to_string(),
            index,
            local: group.nb_local(),
        })?;
    let ctx = NodeCtx::new(&cell, &group, &topology, cluster);
    Ok(cell.request(&ctx, what).unwrap_or_else(|| "done".to_string()))
}

fn forward_to_master(cluster: &Arc<ClusterState>, command: &str, params: &[u8]) -> Result<()> {
    let target = cluster.root().or_else(|| cluster.masters().into_iter().next());
    match target {
        Some(master) => master.send_command(command, params),
        None => Err(CommError::NoRoot),
    }
}
