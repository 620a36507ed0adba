//! Parser for the textual topology description language.
//!
//! Line-oriented; `#` starts a comment. Statements:
//!
//! ```text
//! Host name = addr [threads]      machine declaration
//! type group                      group declaration
//! src -> dst                      link
//! src -o> dst                     link allowing self-delivery
//! src -L> dst                     machine-local link
//! group@machine[count thread?]    placement
//! group@=ref[limit?]              mirrored placement
//! group.key = value               group property
//! ```
//!
//! In a placement bracket, the thread field is `*` (count nodes on every
//! scheduler), an integer (that scheduler), or absent (spread over the
//! lightest schedulers). The whole bracket may be absent (one node). A
//! `*` machine applies the placement to every declared machine.

use {
    crate::{
        cluster::ClusterState,
        error::{CommError, Result},
        topology::{group::ThreadSpec, Link, Topology},
    },
    log::debug,
    std::sync::Arc,
};

/// Parse a description into a fresh topology, declaring machines into the
/// cluster directory as Host statements are met.
pub fn parse(text: &str, cluster: &Arc<ClusterState>) -> Result<Topology> {
    let mut topology = Topology::new(text);
    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        parse_line(line, line_no, &mut topology, cluster)
            .map_err(|e| contextualize(e, line_no))?;
    }
    Ok(topology)
}

fn contextualize(e: CommError, line: usize) -> CommError {
    match e {
        CommError::Parse { .. } => e,
        other => CommError::Parse {
            line,
            reason: other.to_string(),
        },
    }
}

fn parse_error(line: usize, reason: impl Into<String>) -> CommError {
    CommError::Parse {
        line,
        reason: reason.into(),
    }
}

fn parse_line(
    line: &str,
    line_no: usize,
    topology: &mut Topology,
    cluster: &Arc<ClusterState>,
) -> Result<()> {
    if let Some(rest) = line.strip_prefix("Host ") {
        return parse_host(rest, line_no, cluster);
    }
    for (token, allow_self, local_only) in [("-o>", true, false), ("-L>", false, true), ("->", false, false)]
    {
        if let Some((src, dst)) = split_link(line, token) {
            return parse_link(&src, &dst, allow_self, local_only, line_no, topology);
        }
    }
    if line.contains('@') {
        return parse_placement(line, line_no, topology, cluster);
    }
    if let Some((target, value)) = line.split_once('=') {
        let target = target.trim();
        if let Some((group, key)) = target.split_once('.') {
            let group = topology.group_by_name(group.trim())?;
            group.set_property(key.trim(), value.trim());
            return Ok(());
        }
        return Err(parse_error(line_no, format!("cannot assign to {target}")));
    }
    // Two bare identifiers: a group declaration, node type first.
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some(node_type), Some(group), None) => {
            topology.add_group(group, node_type)?;
            Ok(())
        }
        _ => Err(parse_error(line_no, format!("unrecognized statement: {line}"))),
    }
}

fn split_link(line: &str, token: &str) -> Option<(String, String)> {
    let (src, dst) = line.split_once(token)?;
    Some((src.trim().to_string(), dst.trim().to_string()))
}

fn parse_host(rest: &str, line_no: usize, cluster: &Arc<ClusterState>) -> Result<()> {
    let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| parse_error(line_no, "Host wants: Host name = addr [threads]"))?;
    let name = name.trim();
    let mut words = value.split_whitespace();
    let addr = words
        .next()
        .ok_or_else(|| parse_error(line_no, "Host is missing an address"))?;
    let threads = match words.next() {
        Some(t) => t
            .parse::<usize>()
            .map_err(|_| parse_error(line_no, format!("bad thread count {t}")))?,
        None => cluster.config().default_threads,
    };
    if words.next().is_some() {
        return Err(parse_error(line_no, "trailing tokens after Host"));
    }
    let is_local = cluster.is_local_addr(addr);
    cluster.machines().declare(name, addr, threads, is_local)?;
    if is_local {
        cluster.set_local_machine(name);
        cluster.ensure_schedulers(threads)?;
    }
    debug!("host {name} = {addr} ({threads} threads, local={is_local})");
    Ok(())
}

fn parse_link(
    src: &str,
    dst: &str,
    allow_self: bool,
    local_only: bool,
    _line_no: usize,
    topology: &mut Topology,
) -> Result<()> {
    let src_group = topology.group_by_name(src)?;
    let dst_group = topology.group_by_name(dst)?;
    let link = Link::new(src_group.id(), dst_group.id(), allow_self, local_only);
    src_group.add_out_link(link);
    dst_group.add_in_link(link);
    Ok(())
}

fn parse_placement(
    line: &str,
    line_no: usize,
    topology: &mut Topology,
    cluster: &Arc<ClusterState>,
) -> Result<()> {
    let (group_name, target) = line
        .split_once('@')
        .ok_or_else(|| parse_error(line_no, "placement wants group@machine"))?;
    let group = topology.group_by_name(group_name.trim())?;
    let target = target.trim();

    // group@=ref[limit]: mirror another group's records.
    if let Some(reference) = target.strip_prefix('=') {
        let (ref_name, bracket) = split_bracket(reference, line_no)?;
        let reference = topology.group_by_name(ref_name.trim())?;
        let limit = match bracket {
            Some(b) => Some(
                b.trim()
                    .parse::<u64>()
                    .map_err(|_| parse_error(line_no, format!("bad mirror limit {b}")))?,
            ),
            None => None,
        };
        group.assign_same_as(&reference, limit);
        return Ok(());
    }

    let (machine_name, bracket) = split_bracket(target, line_no)?;
    let machine_name = machine_name.trim();
    let (count, thread) = parse_bracket(bracket.as_deref(), line_no)?;

    let machines = if machine_name == "*" {
        cluster.machines().all()
    } else {
        vec![cluster.machines().find(machine_name)?]
    };
    for machine in machines {
        let (total, spec) = match thread {
            BracketThread::Every => (
                count * machine.nb_threads as u64,
                ThreadSpec::PerThread(count),
            ),
            BracketThread::Fixed(t) => (count, ThreadSpec::Fixed(t)),
            BracketThread::Auto => (count, ThreadSpec::Auto),
        };
        group.assign(&machine.name, total, spec, machine.is_local);
    }
    Ok(())
}

enum BracketThread {
    Auto,
    Fixed(usize),
    Every,
}

fn split_bracket(s: &str, line_no: usize) -> Result<(String, Option<String>)> {
    match s.split_once('[') {
        None => Ok((s.to_string(), None)),
        Some((head, rest)) => {
            let body = rest
                .strip_suffix(']')
                .ok_or_else(|| parse_error(line_no, "unterminated ["))?;
            Ok((head.to_string(), Some(body.to_string())))
        }
    }
}

fn parse_bracket(bracket: Option<&str>, line_no: usize) -> Result<(u64, BracketThread)> {
    let Some(body) = bracket else {
        return Ok((1, BracketThread::Auto));
    };
    let mut words = body.split_whitespace();
    let count = match words.next() {
        Some(c) => c
            .parse::<u64>()
            .map_err(|_| parse_error(line_no, format!("bad node count {c}")))?,
        None => 1,
    };
    let thread = match words.next() {
        None => BracketThread::Auto,
        Some("*") => BracketThread::Every,
        Some(t) => BracketThread::Fixed(
            t.parse::<usize>()
                .map_err(|_| parse_error(line_no, format!("bad thread index {t}")))?,
        ),
    };
    if words.next().is_some() {
        return Err(parse_error(line_no, "trailing tokens in placement"));
    }
    Ok((count, thread))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{cluster::ClusterState, config::CommConfig, topology::ThreadSpec},
    };

    fn test_cluster() -> Arc<ClusterState> {
        let cluster = ClusterState::new(CommConfig::dev_default());
        cluster.set_listen_port(10001);
        cluster
    }

    #[test]
    fn test_full_description() {
        let cluster = test_cluster();
        let text = "\
# two machines, two groups
Host here = 127.0.0.1:10001 2
Host there = 10.0.0.2:10001 4

worker alpha
worker beta

alpha -> beta
beta -o> beta

alpha@here[3]
beta@there[2 *]
alpha.rate = 0.5
";
        let topology = parse(text, &cluster).unwrap();
        let alpha = topology.group_by_name("alpha").unwrap();
        let beta = topology.group_by_name("beta").unwrap();
        assert_eq!(alpha.nb_nodes(), 3);
        assert_eq!(alpha.nb_local(), 3);
        // 2 per thread on 4 threads.
        assert_eq!(beta.nb_nodes(), 8);
        assert_eq!(beta.nb_local(), 0);
        assert_eq!(alpha.out_links().len(), 1);
        assert_eq!(beta.out_links().len(), 1);
        assert!(beta.out_links()[0].allow_self());
        assert_eq!(alpha.property("rate").as_deref(), Some("0.5"));
        assert_eq!(cluster.schedulers().len(), 2);
    }

    #[test]
    fn test_placement_defaults_to_one() {
        let cluster = test_cluster();
        let text = "Host h = 127.0.0.1:10001\nworker alpha\nalpha@h\n";
        let topology = parse(text, &cluster).unwrap();
        assert_eq!(topology.group_by_name("alpha").unwrap().nb_nodes(), 1);
    }

    #[test]
    fn test_fixed_thread_placement() {
        let cluster = test_cluster();
        let text = "Host h = 127.0.0.1:10001 3\nworker alpha\nalpha@h[5 1]\n";
        let topology = parse(text, &cluster).unwrap();
        let p = topology.group_by_name("alpha").unwrap().placements();
        assert_eq!(p[0].count, 5);
        assert_eq!(p[0].thread, ThreadSpec::Fixed(1));
    }

    #[test]
    fn test_wildcard_machine() {
        let cluster = test_cluster();
        let text = "\
Host a = 127.0.0.1:10001
Host b = 10.0.0.2:10001
worker alpha
alpha@*[2]
";
        let topology = parse(text, &cluster).unwrap();
        let alpha = topology.group_by_name("alpha").unwrap();
        assert_eq!(alpha.nb_nodes(), 4);
        assert_eq!(alpha.nb_local(), 2);
        assert_eq!(alpha.placements().len(), 2);
    }

    #[test]
    fn test_mirror_placement() {
        let cluster = test_cluster();
        let text = "\
Host h = 127.0.0.1:10001
worker alpha
worker beta
alpha@h[6]
beta@=alpha[4]
";
        let topology = parse(text, &cluster).unwrap();
        assert_eq!(topology.group_by_name("beta").unwrap().nb_nodes(), 4);
    }

    #[test]
    fn test_comments_and_blanks() {
        let cluster = test_cluster();
        let text = "\n# nothing\nworker alpha # trailing\n\n";
        let topology = parse(text, &cluster).unwrap();
        assert!(topology.group_by_name("alpha").is_ok());
    }

    #[test]
    fn test_error_carries_line_number() {
        let cluster = test_cluster();
        let text = "worker alpha\nalpha -> ghost\n";
        let err = parse(text, &cluster).unwrap_err();
        assert!(matches!(err, CommError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_unknown_statement() {
        let cluster = test_cluster();
        let err = parse("this is not a statement\n", &cluster).unwrap_err();
        assert!(matches!(err, CommError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_unknown_machine_in_placement() {
        let cluster = test_cluster();
        let err = parse("worker alpha\nalpha@ghost[1]\n", &cluster).unwrap_err();
        assert!(matches!(err, CommError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let cluster = test_cluster();
        let text = "Host h = 127.0.0.1:10001\nHost h = 10.0.0.2:10001\n";
        let err = parse(text, &cluster).unwrap_err();
        assert!(matches!(err, CommError::Parse { line: 2, .. }));
    }
}
