//! Cluster-wide shared state: membership, topology, schedulers.
//!
//! One [`ClusterState`] exists per process. It is `Arc`-shared into every
//! peer reader, scheduler and command handler; nothing in the crate goes
//! through ambient globals.
//!
//! Roles are derived, never stored: a process with no masters is a root;
//! with neither masters nor slaves it is isolated.

use {
    crate::{
        config::CommConfig,
        connection::normalize_addr,
        error::{CommError, Result},
        machine::MachineDirectory,
        peer::{ChannelKind, Peer},
        registry::NodeRegistry,
        scheduler::Scheduler,
        telemetry::{ClusterSnapshot, GroupSnapshot, MachineSnapshot},
        topology::{parser, Topology},
        wire::Message,
    },
    log::{debug, error, info, warn},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
            Arc, Condvar, Mutex, RwLock, Weak,
        },
        time::Duration,
    },
};

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared state of one plexus process.
pub struct ClusterState {
    config: CommConfig,
    /// Port the listener actually bound (after scanning).
    listen_port: AtomicU16,
    local_machine: Mutex<Option<String>>,
    /// Every live peer, both channels.
    peers: Mutex<Vec<Arc<Peer>>>,
    masters: Mutex<Vec<Arc<Peer>>>,
    slaves: Mutex<Vec<Arc<Peer>>>,
    root: Mutex<Option<Arc<Peer>>>,
    machines: MachineDirectory,
    schedulers: Mutex<Vec<Arc<Scheduler>>>,
    active_schedulers: AtomicUsize,
    topology: RwLock<Option<Arc<Topology>>>,
    registry: NodeRegistry,
    /// Peers waiting for a forwarded `infos_reply`.
    pending_infos: Mutex<Vec<Arc<Peer>>>,
    /// Root's shadow snapshots, one per remote machine.
    shadow: Mutex<HashMap<String, MachineSnapshot>>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    infos_updater: AtomicBool,
    self_weak: Weak<Self>,
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("port", &self.listen_port())
            .field("peers", &lock(&self.peers).len())
            .field("root", &self.is_root())
            .finish()
    }
}

impl ClusterState {
    pub fn new(config: CommConfig) -> Arc<Self> {
        let listen_port = config.listen_port;
        Arc::new_cyclic(|weak| Self {
            config,
            listen_port: AtomicU16::new(listen_port),
            local_machine: Mutex::new(None),
            peers: Mutex::new(Vec::new()),
            masters: Mutex::new(Vec::new()),
            slaves: Mutex::new(Vec::new()),
            root: Mutex::new(None),
            machines: MachineDirectory::default(),
            schedulers: Mutex::new(Vec::new()),
            active_schedulers: AtomicUsize::new(0),
            topology: RwLock::new(None),
            registry: NodeRegistry::new(),
            pending_infos: Mutex::new(Vec::new()),
            shadow: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            infos_updater: AtomicBool::new(false),
            self_weak: Weak::clone(weak),
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn machines(&self) -> &MachineDirectory {
        &self.machines
    }

    /// Port the listener bound, once known.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Acquire)
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Release);
    }

    /// True when `addr` names this process's listener.
    pub fn is_local_addr(&self, addr: &str) -> bool {
        let canon = |a: &str| {
            normalize_addr(a, self.listen_port()).replace("localhost", "127.0.0.1")
        };
        let mine = format!("{}:{}", self.config.advertised_ip, self.listen_port());
        canon(addr) == canon(&mine)
    }

    pub fn set_local_machine(&self, name: &str) {
        *lock(&self.local_machine) = Some(name.to_string());
    }

    /// Name this process's machine was declared under, if any.
    pub fn local_machine(&self) -> Option<String> {
        lock(&self.local_machine).clone()
    }

    // ── Membership ──────────────────────────────────────────────────────

    pub fn add_peer(&self, peer: Arc<Peer>) {
        let mut peers = lock(&self.peers);
        if !peers.iter().any(|p| Arc::ptr_eq(p, &peer)) {
            peers.push(peer);
        }
    }

    pub fn add_master(&self, peer: &Arc<Peer>) {
        let mut masters = lock(&self.masters);
        if !masters.iter().any(|p| Arc::ptr_eq(p, peer)) {
            masters.push(Arc::clone(peer));
        }
    }

    pub fn add_slave(&self, peer: &Arc<Peer>) {
        let mut slaves = lock(&self.slaves);
        if !slaves.iter().any(|p| Arc::ptr_eq(p, peer)) {
            slaves.push(Arc::clone(peer));
        }
    }

    pub fn set_root(&self, peer: &Arc<Peer>) {
        *lock(&self.root) = Some(Arc::clone(peer));
    }

    pub fn root(&self) -> Option<Arc<Peer>> {
        lock(&self.root).clone()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        lock(&self.peers).clone()
    }

    pub fn masters(&self) -> Vec<Arc<Peer>> {
        lock(&self.masters).clone()
    }

    pub fn slaves(&self) -> Vec<Arc<Peer>> {
        lock(&self.slaves).clone()
    }

    /// No masters above us.
    pub fn is_root(&self) -> bool {
        lock(&self.masters).is_empty()
    }

    /// Not connected to anyone in either direction.
    pub fn is_isolated(&self) -> bool {
        lock(&self.masters).is_empty() && lock(&self.slaves).is_empty()
    }

    /// Drop a peer from every membership set. Idempotent; called from the
    /// peer's reader thread when the connection dies.
    pub fn remove_peer(&self, peer: &Arc<Peer>) {
        lock(&self.peers).retain(|p| !Arc::ptr_eq(p, peer));
        lock(&self.masters).retain(|p| !Arc::ptr_eq(p, peer));
        lock(&self.slaves).retain(|p| !Arc::ptr_eq(p, peer));
        {
            let mut root = lock(&self.root);
            if root.as_ref().is_some_and(|r| Arc::ptr_eq(r, peer)) {
                warn!("root connection lost");
                *root = None;
            }
        }
        lock(&self.pending_infos).retain(|p| !Arc::ptr_eq(p, peer));
        self.machines.forget_peer(peer);
    }

    /// Human-readable membership table.
    pub fn dump_peers(&self) -> String {
        let root = self.root();
        let masters = self.masters();
        let slaves = self.slaves();
        let mut out = String::new();
        for peer in self.peers() {
            let mut roles = Vec::new();
            if root.as_ref().is_some_and(|r| Arc::ptr_eq(r, &peer)) {
                roles.push("root");
            }
            if masters.iter().any(|p| Arc::ptr_eq(p, &peer)) {
                roles.push("master");
            }
            if slaves.iter().any(|p| Arc::ptr_eq(p, &peer)) {
                roles.push("slave");
            }
            let kind = match peer.kind() {
                ChannelKind::Command => "cmd",
                ChannelKind::Data => "data",
            };
            out.push_str(&format!(
                "peer {:>3} {} {} [{}]\n",
                peer.id(),
                kind,
                peer.addr(),
                roles.join(",")
            ));
        }
        if out.is_empty() {
            out.push_str("no peers\n");
        }
        out
    }

    // ── Bootstrap ───────────────────────────────────────────────────────

    /// Join an existing network through `bootstrap`, which becomes our
    /// first master.
    pub fn enter_network(self: &Arc<Self>, bootstrap: &str) -> Result<()> {
        let addr = normalize_addr(bootstrap, self.config.listen_port);
        let peer = Peer::connect(
            &addr,
            ChannelKind::Command,
            self.config.connect_attempts,
            self.config.connect_retry_ms,
        )?;
        peer.spawn_reader(Arc::clone(self))?;
        self.add_peer(Arc::clone(&peer));
        self.add_master(&peer);
        peer.send_command("subscribe", self.listen_port().to_string().as_bytes())?;
        info!("subscribed to {addr}");
        Ok(())
    }

    /// Dial a machine that should be part of the network and welcome it
    /// as our slave.
    pub fn invite(self: &Arc<Self>, addr: &str) -> Result<()> {
        let addr = normalize_addr(addr, self.config.listen_port);
        let peer = Peer::connect(
            &addr,
            ChannelKind::Command,
            self.config.connect_attempts,
            self.config.connect_retry_ms,
        )?;
        peer.spawn_reader(Arc::clone(self))?;
        self.add_peer(Arc::clone(&peer));
        self.add_slave(&peer);
        peer.send_command("root_welcome", self.listen_port().to_string().as_bytes())?;
        info!("invited {addr}");
        Ok(())
    }

    // ── Topology ────────────────────────────────────────────────────────

    pub fn topology(&self) -> Option<Arc<Topology>> {
        match self.topology.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Parse and activate a topology description locally, replacing any
    /// previous one wholesale.
    pub fn set_topology_local(self: &Arc<Self>, text: &str) -> Result<()> {
        self.machines.clear();
        let topology = Arc::new(parser::parse(text, self)?);
        {
            let mut slot = match self.topology.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(Arc::clone(&topology));
        }
        topology.activate(self)
    }

    /// Flood a description to every slave, then activate it here. Send
    /// failures are logged and skipped so one dead slave does not stall
    /// the broadcast tree.
    pub fn flood_topology(self: &Arc<Self>, text: &str) -> Result<()> {
        for slave in self.slaves() {
            if let Err(e) = slave.send_command("set_topology", text.as_bytes()) {
                warn!("flooding topology to {} failed: {e}", slave.addr());
            }
        }
        self.set_topology_local(text)
    }

    /// Full model load. An isolated process first invites every machine
    /// the description names, becoming the root; a root floods directly;
    /// anyone else hands the model up toward the root.
    pub fn load_model(self: &Arc<Self>, text: &str) -> Result<()> {
        if self.is_isolated() {
            for addr in scan_host_addrs(text) {
                if self.is_local_addr(&addr) {
                    continue;
                }
                if let Err(e) = self.invite(&addr) {
                    warn!("inviting {addr} failed: {e}");
                }
            }
            self.flood_topology(text)
        } else if self.is_root() {
            self.flood_topology(text)
        } else {
            let target = self.root().or_else(|| self.masters().into_iter().next());
            match target {
                Some(master) => master.send_command("model", text.as_bytes()),
                None => Err(CommError::NoRoot),
            }
        }
    }

    // ── Schedulers ──────────────────────────────────────────────────────

    pub fn schedulers(&self) -> Vec<Arc<Scheduler>> {
        lock(&self.schedulers).clone()
    }

    /// Grow the scheduler pool to at least `n` threads. Never shrinks.
    pub fn ensure_schedulers(&self, n: usize) -> Result<()> {
        let mut schedulers = lock(&self.schedulers);
        while schedulers.len() < n {
            let sched = Scheduler::new(schedulers.len());
            sched.spawn(Weak::clone(&self.self_weak))?;
            self.active_schedulers.fetch_add(1, Ordering::AcqRel);
            schedulers.push(sched);
        }
        Ok(())
    }

    /// Called by each scheduler thread as it exits; the last one out
    /// releases the daemon.
    pub fn scheduler_exited(&self, id: usize) {
        debug!("scheduler {id} reported exit");
        if self.active_schedulers.fetch_sub(1, Ordering::AcqRel) == 1 {
            info!("all schedulers done");
            self.signal_shutdown();
        }
    }

    // ── Data routing ────────────────────────────────────────────────────

    /// Route one inbound node message to its destination scheduler.
    /// Undeliverable messages are logged and dropped.
    pub fn route_data(&self, msg: Message) {
        let Some(topology) = self.topology() else {
            warn!("data frame with no active topology; dropped");
            return;
        };
        match topology.decode_node(msg.dst) {
            Ok((group, index)) => {
                let Some(cell) = group.local_cell(index) else {
                    warn!("{}[{}]: no resident cell; dropped", group.name(), index);
                    return;
                };
                match cell.scheduler() {
                    Some(sched) => sched.enqueue(cell, msg),
                    None => warn!("{}[{}] has no scheduler; dropped", group.name(), index),
                }
            }
            Err(e) => error!("undeliverable data frame: {e}"),
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    pub fn signal_shutdown(&self) {
        *lock(&self.shutdown) = true;
        self.shutdown_cv.notify_all();
    }

    /// Stop schedulers and release `wait_shutdown`.
    pub fn request_exit(&self) {
        for sched in self.schedulers() {
            sched.quit();
        }
        self.signal_shutdown();
    }

    /// Block until the process should exit: last scheduler done or an
    /// explicit exit request.
    pub fn wait_shutdown(&self) {
        let mut done = lock(&self.shutdown);
        while !*done {
            done = match self.shutdown_cv.wait(done) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn push_pending_infos(&self, peer: &Arc<Peer>) {
        lock(&self.pending_infos).push(Arc::clone(peer));
    }

    pub fn take_pending_infos(&self) -> Vec<Arc<Peer>> {
        std::mem::take(&mut lock(&self.pending_infos))
    }

    /// Merge a slave's snapshot into the root's shadow copies.
    pub fn update_shadow(&self, snapshot: MachineSnapshot) {
        lock(&self.shadow).insert(snapshot.machine.clone(), snapshot);
    }

    /// Snapshot of this machine's residents. Rates are whatever the last
    /// sampling pass produced.
    pub fn local_snapshot(&self) -> MachineSnapshot {
        let machine = self.local_machine().unwrap_or_else(|| "local".to_string());
        let mut groups = Vec::new();
        if let Some(topology) = self.topology() {
            for group in topology.groups() {
                let cells = group.local_cells();
                if cells.is_empty() {
                    continue;
                }
                let mut agg = GroupSnapshot::empty(group.name());
                for cell in cells {
                    agg.fold(&cell.telemetry.snapshot(cell.index(), cell.is_attached()));
                }
                groups.push(agg);
            }
        }
        MachineSnapshot { machine, groups }
    }

    /// The whole-cluster view: our residents plus every shadow, sorted by
    /// machine name.
    pub fn cluster_snapshot(&self) -> ClusterSnapshot {
        let mut machines = vec![self.local_snapshot()];
        machines.extend(lock(&self.shadow).values().cloned());
        machines.sort_by(|a, b| a.machine.cmp(&b.machine));
        ClusterSnapshot { machines }
    }

    /// Force a rate sampling pass, e.g. before answering `infos` when
    /// the periodic updater is not running.
    pub fn sample_now(&self) {
        self.sample_all_rates();
    }

    fn sample_all_rates(&self) {
        if let Some(topology) = self.topology() {
            for group in topology.groups() {
                for cell in group.local_cells() {
                    cell.telemetry.sample_rates();
                }
            }
        }
    }

    /// Start the periodic telemetry pass: sample rates every interval
    /// and, when we have a root, push our snapshot up to it. Idempotent.
    pub fn start_infos_updater(&self) {
        if self.infos_updater.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Weak::clone(&self.self_weak);
        let interval = Duration::from_millis(self.config.infos_interval_ms);
        let spawned = std::thread::Builder::new()
            .name("plexusInfos".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                let Some(cluster) = weak.upgrade() else {
                    return;
                };
                if *lock(&cluster.shutdown) {
                    return;
                }
                cluster.sample_all_rates();
                if let Some(root) = cluster.root() {
                    match serde_json::to_string(&cluster.local_snapshot()) {
                        Ok(json) => {
                            if let Err(e) = root.send_command("update_infos", json.as_bytes()) {
                                warn!("telemetry push failed: {e}");
                            }
                        }
                        Err(e) => error!("telemetry serialization failed: {e}"),
                    }
                }
            });
        if let Err(e) = spawned {
            error!("could not start telemetry thread: {e}");
            self.infos_updater.store(false, Ordering::Release);
        }
    }
}

/// Pull the addresses out of a description's Host statements without
/// fully parsing it. Model loading invites machines up front.
fn scan_host_addrs(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|raw| {
            let line = raw.split('#').next().unwrap_or("").trim();
            let rest = line.strip_prefix("Host ")?;
            let (_, value) = rest.split_once('=')?;
            value.split_whitespace().next().map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_host_addrs() {
        let text = "# model\nHost a = 10.0.0.1:10001 2\nworker w\nHost b = 10.0.0.2\n";
        assert_eq!(scan_host_addrs(text), vec!["10.0.0.1:10001", "10.0.0.2"]);
    }

    #[test]
    fn test_roles_derive_from_membership() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        assert!(cluster.is_root());
        assert!(cluster.is_isolated());
    }

    #[test]
    fn test_is_local_addr() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        cluster.set_listen_port(10001);
        assert!(cluster.is_local_addr("127.0.0.1:10001"));
        assert!(cluster.is_local_addr("localhost:10001"));
        assert!(cluster.is_local_addr("127.0.0.1"));
        assert!(!cluster.is_local_addr("127.0.0.1:10002"));
        assert!(!cluster.is_local_addr("10.0.0.2:10001"));
    }

    #[test]
    fn test_set_topology_local() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        cluster.set_listen_port(10001);
        cluster.registry().register("idle", || {
            struct Idle;
            impl crate::node::NodeLogic for Idle {}
            Box::new(Idle)
        });
        let text = "Host h = 127.0.0.1:10001 1\nidle alpha\nalpha@h[2]\n";
        cluster.set_topology_local(text).unwrap();
        let topology = cluster.topology().unwrap();
        assert_eq!(topology.group_by_name("alpha").unwrap().nb_local(), 2);
        assert_eq!(cluster.schedulers().len(), 1);
        cluster.request_exit();
        cluster.wait_shutdown();
    }

    #[test]
    fn test_topology_replaced_wholesale() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        cluster.set_listen_port(10001);
        cluster.registry().register("idle", || {
            struct Idle;
            impl crate::node::NodeLogic for Idle {}
            Box::new(Idle)
        });
        cluster
            .set_topology_local("Host h = 127.0.0.1:10001 1\nidle alpha\nalpha@h[1]\n")
            .unwrap();
        cluster
            .set_topology_local("Host h = 127.0.0.1:10001 1\nidle beta\nbeta@h[3]\n")
            .unwrap();
        let topology = cluster.topology().unwrap();
        assert!(topology.group_by_name("alpha").is_err());
        assert_eq!(topology.group_by_name("beta").unwrap().nb_local(), 3);
        cluster.request_exit();
        cluster.wait_shutdown();
    }

    #[test]
    fn test_local_snapshot_groups() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        cluster.set_listen_port(10001);
        cluster.registry().register("idle", || {
            struct Idle;
            impl crate::node::NodeLogic for Idle {}
            Box::new(Idle)
        });
        cluster
            .set_topology_local("Host h = 127.0.0.1:10001 1\nidle alpha\nalpha@h[2]\n")
            .unwrap();
        let snap = cluster.local_snapshot();
        assert_eq!(snap.machine, "h");
        assert_eq!(snap.groups.len(), 1);
        assert_eq!(snap.groups[0].nb_nodes, 2);
        cluster.request_exit();
        cluster.wait_shutdown();
    }

    #[test]
    fn test_dump_peers_empty() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        assert_eq!(cluster.dump_peers(), "no peers\n");
    }
}
