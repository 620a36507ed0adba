//! Groups: homogeneous node populations and their placement records.

use {
    crate::{
        cluster::ClusterState,
        error::{CommError, Result},
        node::NodeCell,
        scheduler::dispatch_deliver,
        topology::{link::resolve_neighbor, node_id, Link, Topology},
        wire::Message,
    },
    log::{debug, warn},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, RwLock,
        },
    },
};

/// Where a placement's nodes go within a machine's schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSpec {
    /// Spread over the machine's schedulers, lightest first.
    Auto,
    /// All nodes on one scheduler.
    Fixed(usize),
    /// This many nodes on every scheduler of the machine.
    PerThread(u64),
}

/// One (group, machine) residency record. Duplicate records for the same
/// machine are merged at assignment, so at most one exists per pair.
#[derive(Debug, Clone)]
pub struct Placement {
    pub machine: String,
    /// Total nodes of the group on that machine.
    pub count: u64,
    pub thread: ThreadSpec,
    pub is_local: bool,
    /// Set when the data channel to the machine could not be established.
    pub errored: Arc<AtomicBool>,
}

/// A named population of identically-typed nodes.
///
/// Built mutably while a description is parsed, then shared read-mostly;
/// counts are atomics so out-degrees are always computed from live values.
pub struct Group {
    id: u32,
    name: String,
    node_type: String,
    out_links: RwLock<Vec<Link>>,
    in_links: RwLock<Vec<Link>>,
    placements: RwLock<Vec<Placement>>,
    properties: RwLock<HashMap<String, String>>,
    nb_nodes: AtomicU64,
    nb_local: AtomicU64,
    cells: Mutex<Vec<Arc<NodeCell>>>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("nb_nodes", &self.nb_nodes())
            .field("nb_local", &self.nb_local())
            .finish()
    }
}

impl Group {
    pub fn new(id: u32, name: &str, node_type: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            node_type: node_type.to_string(),
            out_links: RwLock::new(Vec::new()),
            in_links: RwLock::new(Vec::new()),
            placements: RwLock::new(Vec::new()),
            properties: RwLock::new(HashMap::new()),
            nb_nodes: AtomicU64::new(0),
            nb_local: AtomicU64::new(0),
            cells: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Total node count across all machines.
    pub fn nb_nodes(&self) -> u64 {
        self.nb_nodes.load(Ordering::Acquire)
    }

    /// Node count resident on this machine.
    pub fn nb_local(&self) -> u64 {
        self.nb_local.load(Ordering::Acquire)
    }

    fn read_lock<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
        match lock.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_lock<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
        match lock.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn add_out_link(&self, link: Link) {
        Self::write_lock(&self.out_links).push(link);
    }

    pub(crate) fn add_in_link(&self, link: Link) {
        Self::write_lock(&self.in_links).push(link);
    }

    pub fn out_links(&self) -> Vec<Link> {
        Self::read_lock(&self.out_links).clone()
    }

    pub fn in_links(&self) -> Vec<Link> {
        Self::read_lock(&self.in_links).clone()
    }

    pub fn placements(&self) -> Vec<Placement> {
        Self::read_lock(&self.placements).clone()
    }

    /// Record `count` nodes on `machine`. A second assignment to the same
    /// machine merges into the existing record, keeping its thread spec.
    pub fn assign(&self, machine: &str, count: u64, thread: ThreadSpec, is_local: bool) {
        let mut placements = Self::write_lock(&self.placements);
        if let Some(p) = placements.iter_mut().find(|p| p.machine == machine) {
            p.count += count;
        } else {
            placements.push(Placement {
                machine: machine.to_string(),
                count,
                thread,
                is_local,
                errored: Arc::new(AtomicBool::new(false)),
            });
        }
        drop(placements);
        self.nb_nodes.fetch_add(count, Ordering::AcqRel);
        if is_local {
            self.nb_local.fetch_add(count, Ordering::AcqRel);
        }
    }

    /// Mirror another group's placements, optionally capping the total.
    pub fn assign_same_as(&self, reference: &Group, limit: Option<u64>) {
        let mut budget = limit.unwrap_or(u64::MAX);
        for p in reference.placements() {
            if budget == 0 {
                break;
            }
            let count = p.count.min(budget);
            budget -= count;
            self.assign(&p.machine, count, p.thread, p.is_local);
        }
    }

    pub fn set_property(&self, key: &str, value: &str) {
        Self::write_lock(&self.properties).insert(key.to_string(), value.to_string());
    }

    pub fn property(&self, key: &str) -> Option<String> {
        Self::read_lock(&self.properties).get(key).cloned()
    }

    /// Total reachable neighbors over all outbound links, computed live.
    pub fn nb_outs(&self, topology: &Topology) -> u64 {
        Self::read_lock(&self.out_links)
            .iter()
            .map(|l| l.out_degree(topology))
            .sum()
    }

    pub(crate) fn push_cell(&self, cell: Arc<NodeCell>) {
        match self.cells.lock() {
            Ok(mut g) => g.push(cell),
            Err(poisoned) => poisoned.into_inner().push(cell),
        }
    }

    /// Resident node by dense local index.
    pub fn local_cell(&self, index: u64) -> Option<Arc<NodeCell>> {
        match self.cells.lock() {
            Ok(g) => g.get(index as usize).cloned(),
            Err(poisoned) => poisoned.into_inner().get(index as usize).cloned(),
        }
    }

    /// All resident nodes, in local-index order.
    pub fn local_cells(&self) -> Vec<Arc<NodeCell>> {
        match self.cells.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ── Send path ───────────────────────────────────────────────────────

    /// Route a message from resident node `self_index` to its
    /// `neighbor`-th reachable node.
    ///
    /// Walks outbound links in declaration order, subtracting live
    /// out-degrees until the owning link is found, then resolves the
    /// destination index (skipping the sender on no-self self-links).
    /// Returns `false` on any failure so the caller can roll back; a
    /// neighbor ordinal past the total out-degree is also reported as
    /// `false` after logging.
    pub fn send_out(
        self: &Arc<Self>,
        self_index: u64,
        neighbor: u64,
        msg: &mut Message,
        topology: &Arc<Topology>,
        cluster: &Arc<ClusterState>,
    ) -> bool {
        msg.src = node_id(self.id, self_index);
        let mut rest = neighbor;
        // Snapshot the links: a direct same-thread delivery below may
        // re-enter this group's send path from the receiving node.
        for link in self.out_links() {
            let degree = link.out_degree(topology);
            if rest < degree {
                let target = if link.is_self_link() && !link.allow_self() {
                    resolve_neighbor(rest, self_index, degree + 1, false)
                } else {
                    rest
                };
                let Some(dst) = topology.group_by_id(link.dst()) else {
                    warn!("link from {} references unknown group id {}", self.name, link.dst());
                    return false;
                };
                return dst.send_to(target, msg, link.local_only(), cluster);
            }
            rest -= degree;
        }
        warn!(
            "{}[{}]: neighbor {} out of range (out-degree {})",
            self.name,
            self_index,
            neighbor,
            self.nb_outs(topology)
        );
        false
    }

    /// Deliver to the node at `index` of this group, in the sender
    /// machine's index space: local residents first, then remote
    /// placements in declaration order.
    pub(crate) fn send_to(
        self: &Arc<Self>,
        index: u64,
        msg: &mut Message,
        local_space: bool,
        cluster: &Arc<ClusterState>,
    ) -> bool {
        let nb_local = self.nb_local();
        if index < nb_local {
            return self.deliver_local(index, msg, cluster);
        }
        if local_space {
            warn!(
                "{}: local-only index {} out of range ({} residents)",
                self.name, index, nb_local
            );
            return false;
        }

        // Remote: find the owning machine, re-index into its slice. The
        // receiver resolves that slice index in its own local numbering,
        // which keeps senders ignorant of where nodes actually live.
        let mut rest = index - nb_local;
        for p in Self::read_lock(&self.placements).iter().filter(|p| !p.is_local) {
            if rest < p.count {
                msg.dst = node_id(self.id, rest);
                return match cluster.machines().send_data(&p.machine, msg) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("send to {} on {} failed: {e}", self.name, p.machine);
                        p.errored.store(true, Ordering::Release);
                        false
                    }
                };
            }
            rest -= p.count;
        }
        warn!("{}: destination index {} resolves to no placement", self.name, index);
        false
    }

    fn deliver_local(self: &Arc<Self>, index: u64, msg: &mut Message, cluster: &Arc<ClusterState>) -> bool {
        let Some(cell) = self.local_cell(index) else {
            warn!("{}: no resident cell at index {}", self.name, index);
            return false;
        };
        msg.dst = node_id(self.id, index);
        if cell.is_finished() {
            // Terminal nodes silently absorb traffic.
            debug!("{}[{}] finished; message dropped", self.name, index);
            return true;
        }
        let Some(sched) = cell.scheduler() else {
            warn!("{}[{}] has no scheduler", self.name, index);
            return false;
        };
        // Same-thread deliveries run synchronously, unless the target's
        // body is already on this call stack (a node messaging itself,
        // or a send cycle), which must queue to avoid re-entry.
        if !sched.is_current() || crate::node::cell_in_dispatch(&cell) {
            sched.enqueue(cell, msg.clone());
        } else {
            dispatch_deliver(&cell, msg, cluster);
        }
        true
    }

    // ── Activation ──────────────────────────────────────────────────────

    /// Instantiate every local resident of this group and hand the cells
    /// to their schedulers. Indices are dense, following placement order.
    pub(crate) fn instantiate_local(self: &Arc<Self>, cluster: &Arc<ClusterState>) -> Result<()> {
        let placements = self.placements();
        let local: Vec<&Placement> = placements.iter().filter(|p| p.is_local).collect();
        if local.is_empty() {
            return Ok(());
        }
        let schedulers = cluster.schedulers();
        if schedulers.is_empty() {
            return Err(CommError::ThreadOutOfRange {
                thread: 0,
                available: 0,
            });
        }

        let mut next_index: u64 = 0;
        for p in local {
            let targets: Vec<(usize, u64)> = match p.thread {
                ThreadSpec::Fixed(t) => {
                    if t >= schedulers.len() {
                        return Err(CommError::ThreadOutOfRange {
                            thread: t,
                            available: schedulers.len(),
                        });
                    }
                    vec![(t, p.count)]
                }
                ThreadSpec::PerThread(per) => {
                    (0..schedulers.len()).map(|t| (t, per)).collect()
                }
                ThreadSpec::Auto => spread_lightest(&schedulers, p.count),
            };
            for (t, count) in targets {
                let sched = &schedulers[t];
                for _ in 0..count {
                    let logic = cluster.registry().create(&self.node_type)?;
                    let cell = NodeCell::new(
                        next_index,
                        Arc::downgrade(self),
                        Arc::downgrade(sched),
                        logic,
                    );
                    next_index += 1;
                    sched.register_cell();
                    self.push_cell(Arc::clone(&cell));
                    cell.attach();
                }
            }
        }
        debug!("group {}: {} residents instantiated", self.name, next_index);
        Ok(())
    }
}

/// Distribute `count` nodes over schedulers: an even share each, with the
/// remainder handed out starting from the lightest-loaded.
fn spread_lightest(schedulers: &[Arc<crate::scheduler::Scheduler>], count: u64) -> Vec<(usize, u64)> {
    let threads = schedulers.len() as u64;
    let per = count / threads;
    let rem = count % threads;
    let mut order: Vec<usize> = (0..schedulers.len()).collect();
    order.sort_by_key(|&i| schedulers[i].load());
    order
        .iter()
        .enumerate()
        .map(|(pos, &i)| (i, per + u64::from((pos as u64) < rem)))
        .filter(|&(_, n)| n > 0)
        .collect()
}
