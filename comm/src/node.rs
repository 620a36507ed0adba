//! Node bodies and their runtime shells.
//!
//! Application behavior lives in a [`NodeLogic`] implementation; the
//! runtime wraps each instance in a [`NodeCell`] that carries identity,
//! lifecycle flags and telemetry. Bodies never see the cell directly:
//! every callback receives a [`NodeCtx`] scoped to the dispatch.

use {
    crate::{
        cluster::ClusterState,
        telemetry::NodeTelemetry,
        topology::{Group, Topology},
        wire::Message,
    },
    log::{debug, error, warn},
    std::{
        cell::RefCell,
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, Weak,
        },
    },
};

thread_local! {
    /// Cells whose bodies are on the current thread's call stack. A
    /// synchronous delivery that would re-enter one of them must be
    /// queued instead (the logic mutex is not re-entrant).
    static DISPATCH_STACK: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// True when `cell`'s body is already executing on this thread.
pub(crate) fn cell_in_dispatch(cell: &Arc<NodeCell>) -> bool {
    let ptr = Arc::as_ptr(cell) as usize;
    DISPATCH_STACK.with(|s| s.borrow().contains(&ptr))
}

/// Outcome of one node body callback.
///
/// `Warning` is logged and execution continues; `Fatal` is logged and the
/// process exits, mirroring an unrecoverable application error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Ok,
    Warning(String),
    Fatal(String),
}

/// Behavior of one node. Implementations are registered by type name and
/// instantiated per resident node at topology activation.
///
/// All callbacks run on the node's scheduler thread; `&mut self` access is
/// exclusive for the duration of a dispatch.
pub trait NodeLogic: Send {
    /// Called once, lazily, before the first `process` or `on_receive`.
    fn init(&mut self, _ctx: &NodeCtx) -> NodeStatus {
        NodeStatus::Ok
    }

    /// One autonomous activity tick, driven by random scheduler draws.
    fn process(&mut self, _ctx: &NodeCtx) -> NodeStatus {
        NodeStatus::Ok
    }

    /// Inbound message delivery. `msg` arrives with its cursor rewound.
    fn on_receive(&mut self, _ctx: &NodeCtx, _msg: &mut Message) -> NodeStatus {
        NodeStatus::Ok
    }

    /// Answer an operator query. `None` means the node has nothing to say.
    fn on_request(&mut self, _ctx: &NodeCtx, _what: &str) -> Option<String> {
        None
    }
}

impl std::fmt::Debug for dyn NodeLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn NodeLogic")
    }
}

// ── NodeCell ────────────────────────────────────────────────────────────────

/// Runtime shell around one resident node.
pub struct NodeCell {
    index: u64,
    group: Weak<Group>,
    scheduler: Weak<crate::scheduler::Scheduler>,
    attached: AtomicBool,
    finished: AtomicBool,
    inited: AtomicBool,
    pub telemetry: NodeTelemetry,
    logic: Mutex<Box<dyn NodeLogic>>,
}

impl std::fmt::Debug for NodeCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCell")
            .field("index", &self.index)
            .field("attached", &self.is_attached())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl NodeCell {
    /// Shell a logic instance. Nodes start detached; activation attaches
    /// them once they are registered with a scheduler.
    pub fn new(
        index: u64,
        group: Weak<Group>,
        scheduler: Weak<crate::scheduler::Scheduler>,
        logic: Box<dyn NodeLogic>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            group,
            scheduler,
            attached: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            inited: AtomicBool::new(false),
            telemetry: NodeTelemetry::default(),
            logic: Mutex::new(logic),
        })
    }

    /// Local index of this node within its group.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Owning group, if the topology is still alive.
    pub fn group(&self) -> Option<Arc<Group>> {
        self.group.upgrade()
    }

    /// Owning scheduler, if still alive.
    pub fn scheduler(&self) -> Option<Arc<crate::scheduler::Scheduler>> {
        self.scheduler.upgrade()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Mark the node eligible for scheduling. Idempotent; a finished node
    /// stays finished.
    pub fn attach(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }
        if !self.attached.swap(true, Ordering::AcqRel) {
            if let Some(sched) = self.scheduler.upgrade() {
                sched.attach_cell(self);
            }
        }
    }

    /// Remove the node from scheduling without ending it. Idempotent.
    /// Detached nodes still receive messages.
    pub fn detach(self: &Arc<Self>) {
        if self.attached.swap(false, Ordering::AcqRel) {
            if let Some(sched) = self.scheduler.upgrade() {
                sched.detach_cell(self);
            }
        }
    }

    /// Terminal: detach and drop out of the live-node count. After this
    /// the node is never scheduled or delivered to again.
    pub fn finish(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.attached.swap(false, Ordering::AcqRel) {
            if let Some(sched) = self.scheduler.upgrade() {
                sched.detach_cell(self);
            }
        }
        if let Some(sched) = self.scheduler.upgrade() {
            sched.cell_finished();
        }
        debug!("node {} finished", self.index);
    }

    fn ensure_init(self: &Arc<Self>, ctx: &NodeCtx) {
        if self.inited.swap(true, Ordering::AcqRel) {
            return;
        }
        let outcome = self.with_logic(ctx, |logic, ctx| logic.init(ctx));
        handle_status(ctx, outcome);
    }

    /// One scheduler draw: lazy init, then `process` if still attached.
    pub fn tick(self: &Arc<Self>, ctx: &NodeCtx) {
        if self.is_finished() {
            return;
        }
        self.ensure_init(ctx);
        if !self.is_attached() || self.is_finished() {
            return;
        }
        let outcome = self.with_logic(ctx, |logic, ctx| logic.process(ctx));
        // Like sends, only successful ticks count.
        if matches!(outcome, NodeStatus::Ok) {
            self.telemetry.record_process();
        }
        handle_status(ctx, outcome);
    }

    /// Deliver one inbound message, initializing the node first if needed.
    pub fn deliver(self: &Arc<Self>, ctx: &NodeCtx, msg: &mut Message) {
        if self.is_finished() {
            debug!("dropping message for finished node {}", self.index);
            return;
        }
        self.ensure_init(ctx);
        if self.is_finished() {
            return;
        }
        self.telemetry.record_recv(msg.total_size() as u64);
        msg.rewind();
        let outcome = self.with_logic(ctx, |logic, ctx| logic.on_receive(ctx, msg));
        handle_status(ctx, outcome);
    }

    /// Operator query against this node.
    pub fn request(self: &Arc<Self>, ctx: &NodeCtx, what: &str) -> Option<String> {
        if self.is_finished() {
            return None;
        }
        self.ensure_init(ctx);
        match self.logic.lock() {
            Ok(mut logic) => logic.on_request(ctx, what),
            Err(poisoned) => poisoned.into_inner().on_request(ctx, what),
        }
    }

    /// Run a body callback with panic containment. A panicking node is
    /// finished; the rest of the cluster keeps running.
    fn with_logic<F>(self: &Arc<Self>, ctx: &NodeCtx, f: F) -> NodeStatus
    where
        F: FnOnce(&mut Box<dyn NodeLogic>, &NodeCtx) -> NodeStatus,
    {
        let ptr = Arc::as_ptr(self) as usize;
        DISPATCH_STACK.with(|s| s.borrow_mut().push(ptr));
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut logic = match self.logic.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut logic, ctx)
        }));
        DISPATCH_STACK.with(|s| {
            s.borrow_mut().pop();
        });
        match result {
            Ok(status) => status,
            Err(_) => {
                error!(
                    "node {}[{}] panicked; finishing it",
                    ctx.group_name(),
                    self.index
                );
                self.finish();
                NodeStatus::Ok
            }
        }
    }
}

fn handle_status(ctx: &NodeCtx, status: NodeStatus) {
    match status {
        NodeStatus::Ok => {}
        NodeStatus::Warning(msg) => {
            warn!("node {}[{}]: {msg}", ctx.group_name(), ctx.index());
        }
        NodeStatus::Fatal(msg) => {
            error!("node {}[{}] fatal: {msg}", ctx.group_name(), ctx.index());
            std::process::exit(1);
        }
    }
}

// ── NodeCtx ─────────────────────────────────────────────────────────────────

/// Per-dispatch view a node body gets of its surroundings.
pub struct NodeCtx<'a> {
    pub(crate) cell: &'a Arc<NodeCell>,
    pub(crate) group: &'a Arc<Group>,
    pub(crate) topology: &'a Arc<Topology>,
    pub(crate) cluster: &'a Arc<ClusterState>,
}

impl<'a> NodeCtx<'a> {
    pub(crate) fn new(
        cell: &'a Arc<NodeCell>,
        group: &'a Arc<Group>,
        topology: &'a Arc<Topology>,
        cluster: &'a Arc<ClusterState>,
    ) -> Self {
        Self {
            cell,
            group,
            topology,
            cluster,
        }
    }

    /// Local index of this node within its group.
    pub fn index(&self) -> u64 {
        self.cell.index()
    }

    /// Name of the owning group.
    pub fn group_name(&self) -> &str {
        self.group.name()
    }

    /// Total number of reachable neighbors across all outbound links.
    pub fn nb_outs(&self) -> u64 {
        self.group.nb_outs(self.topology)
    }

    /// Send `msg` to the `neighbor`-th reachable node. Returns `true` on
    /// success; on failure the caller rolls back and retries later.
    pub fn send(&self, neighbor: u64, msg: &mut Message) -> bool {
        let bytes = msg.total_size() as u64;
        let ok = self
            .group
            .send_out(self.cell.index(), neighbor, msg, self.topology, self.cluster);
        if ok {
            self.cell.telemetry.record_send(bytes);
        }
        ok
    }

    /// Group property as text.
    pub fn property(&self, key: &str) -> Option<String> {
        self.group.property(key)
    }

    /// Group property parsed as an integer, or `default`.
    pub fn property_int(&self, key: &str, default: i64) -> i64 {
        self.group
            .property(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Group property parsed as a float, or `default`.
    pub fn property_float(&self, key: &str, default: f64) -> f64 {
        self.group
            .property(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Re-enter the scheduling pool.
    pub fn attach(&self) {
        self.cell.attach();
    }

    /// Leave the scheduling pool while staying reachable.
    pub fn detach(&self) {
        self.cell.detach();
    }

    /// End this node for good.
    pub fn finish(&self) {
        self.cell.finish();
    }

    /// Expose a scalar through introspection.
    pub fn set_info_1(&self, v: f64) {
        self.cell.telemetry.set_info_1(v);
    }

    /// Expose a second scalar through introspection.
    pub fn set_info_2(&self, v: f64) {
        self.cell.telemetry.set_info_2(v);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{cluster::ClusterState, config::CommConfig, topology::Topology},
    };

    /// Cycles through Ok, Warning, Ok on successive ticks.
    struct Moody {
        ticks: u32,
    }

    impl NodeLogic for Moody {
        fn process(&mut self, _ctx: &NodeCtx) -> NodeStatus {
            self.ticks += 1;
            if self.ticks == 2 {
                NodeStatus::Warning("off day".to_string())
            } else {
                NodeStatus::Ok
            }
        }
    }

    #[test]
    fn test_only_successful_ticks_are_counted() {
        let cluster = ClusterState::new(CommConfig::dev_default());
        let mut topology = Topology::new("");
        let group = topology.add_group("alpha", "moody").unwrap();
        let topology = Arc::new(topology);
        let cell = NodeCell::new(
            0,
            Arc::downgrade(&group),
            Weak::new(),
            Box::new(Moody { ticks: 0 }),
        );
        cell.attach();

        let ctx = NodeCtx::new(&cell, &group, &topology, &cluster);
        cell.tick(&ctx);
        cell.tick(&ctx); // Warning; must not count
        cell.tick(&ctx);
        assert_eq!(cell.telemetry.snapshot(0, true).nb_process, 2);
    }
}
