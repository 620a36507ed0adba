//! Cooperative node schedulers.
//!
//! One [`Scheduler`] owns one OS thread and a set of resident nodes. The
//! loop alternates between draining the inbound message FIFO and advancing
//! one uniformly random attached node. Cross-thread delivery always goes
//! through the FIFO; same-thread delivery is dispatched directly by the
//! sender (see the topology send path), except when the target's body is
//! already on the call stack, which is queued to avoid re-entering it.

use {
    crate::{cluster::ClusterState, node::{NodeCell, NodeCtx}, wire::Message},
    crossbeam_channel::{unbounded, Receiver, Sender},
    log::{debug, trace, warn},
    rand::Rng,
    std::{
        sync::{Arc, Condvar, Mutex, Weak},
        thread::{Builder, JoinHandle, ThreadId},
        time::{Duration, Instant},
    },
};

enum Task {
    Deliver {
        cell: Arc<NodeCell>,
        msg: Message,
    },
}

struct SchedState {
    /// Nodes currently eligible for random draws.
    attached: Vec<Arc<NodeCell>>,
    /// Residents not yet finished.
    live: u64,
    /// Set once the scheduler has hosted at least one resident.
    had_nodes: bool,
    /// Activation gate; draws only happen once started.
    started: bool,
    quit: bool,
}

/// One scheduling thread and its resident-node bookkeeping.
pub struct Scheduler {
    id: usize,
    tx: Sender<Task>,
    rx: Receiver<Task>,
    state: Mutex<SchedState>,
    wakeup: Condvar,
    thread_id: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("load", &self.load())
            .finish()
    }
}

impl Scheduler {
    pub fn new(id: usize) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            id,
            tx,
            rx,
            state: Mutex::new(SchedState {
                attached: Vec::new(),
                live: 0,
                had_nodes: false,
                started: false,
                quit: false,
            }),
            wakeup: Condvar::new(),
            thread_id: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Residents not yet finished. The placement heuristic uses this to
    /// find the lightest scheduler.
    pub fn load(&self) -> u64 {
        self.lock_state().live
    }

    /// Account a new resident before it is attached.
    pub fn register_cell(&self) {
        let mut state = self.lock_state();
        state.live += 1;
        state.had_nodes = true;
    }

    /// Open the gate: residents are in place, draws may begin.
    pub fn start(&self) {
        self.lock_state().started = true;
        self.wakeup.notify_all();
    }

    /// Ask the loop to exit regardless of remaining residents.
    pub fn quit(&self) {
        self.lock_state().quit = true;
        self.wakeup.notify_all();
    }

    pub(crate) fn attach_cell(&self, cell: &Arc<NodeCell>) {
        let mut state = self.lock_state();
        if !state.attached.iter().any(|c| Arc::ptr_eq(c, cell)) {
            state.attached.push(Arc::clone(cell));
        }
        drop(state);
        self.wakeup.notify_all();
    }

    pub(crate) fn detach_cell(&self, cell: &Arc<NodeCell>) {
        let mut state = self.lock_state();
        state.attached.retain(|c| !Arc::ptr_eq(c, cell));
    }

    pub(crate) fn cell_finished(&self) {
        let mut state = self.lock_state();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.wakeup.notify_all();
    }

    /// Queue one inbound message for a resident of this scheduler.
    pub fn enqueue(&self, cell: Arc<NodeCell>, msg: Message) {
        if self.tx.send(Task::Deliver { cell, msg }).is_err() {
            warn!("scheduler {} queue closed; message dropped", self.id);
        }
        self.wakeup.notify_all();
    }

    /// True when called from this scheduler's own thread.
    pub fn is_current(&self) -> bool {
        let tid = match self.thread_id.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        };
        tid == Some(std::thread::current().id())
    }

    /// Spawn the scheduling thread. The loop runs until every resident
    /// has finished (after hosting at least one) or `quit` is called,
    /// then reports its exit to the cluster.
    pub fn spawn(self: &Arc<Self>, cluster: Weak<ClusterState>) -> std::io::Result<JoinHandle<()>> {
        let sched = Arc::clone(self);
        Builder::new()
            .name(format!("plexusSched{:02}", self.id))
            .spawn(move || {
                {
                    let mut tid = match sched.thread_id.lock() {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *tid = Some(std::thread::current().id());
                }
                sched.run(&cluster);
                if let Some(cluster) = cluster.upgrade() {
                    cluster.scheduler_exited(sched.id);
                }
            })
    }

    fn run(self: &Arc<Self>, cluster: &Weak<ClusterState>) {
        debug!("scheduler {} running", self.id);
        let mut rng = rand::rng();
        let mut ticks: u64 = 0;
        let mut last_report = Instant::now();

        loop {
            // Sleep until there is something to do or a reason to leave.
            {
                let mut state = self.lock_state();
                loop {
                    if state.quit || (state.had_nodes && state.live == 0) {
                        drop(state);
                        debug!("scheduler {} exiting", self.id);
                        return;
                    }
                    let runnable =
                        state.started && (!state.attached.is_empty() || !self.rx.is_empty());
                    if runnable {
                        break;
                    }
                    state = match self.wakeup.wait_timeout(state, Duration::from_millis(100)) {
                        Ok((g, _)) => g,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }

            let Some(cluster) = cluster.upgrade() else {
                return;
            };

            // Inbound messages first, the whole backlog.
            while let Ok(task) = self.rx.try_recv() {
                match task {
                    Task::Deliver { cell, mut msg } => {
                        dispatch_deliver(&cell, &mut msg, &cluster);
                    }
                }
            }

            // One random draw over the attached set.
            let drawn = {
                let state = self.lock_state();
                if state.attached.is_empty() {
                    None
                } else {
                    let i = rng.random_range(0..state.attached.len());
                    Some(Arc::clone(&state.attached[i]))
                }
            };
            if let Some(cell) = drawn {
                if let (Some(group), Some(topology)) = (cell.group(), cluster.topology()) {
                    let ctx = NodeCtx::new(&cell, &group, &topology, &cluster);
                    cell.tick(&ctx);
                    ticks += 1;
                }
            }

            if last_report.elapsed() >= Duration::from_secs(1) {
                debug!(
                    "scheduler {}: {} ticks/s, load {}",
                    self.id,
                    ticks,
                    self.load()
                );
                ticks = 0;
                last_report = Instant::now();
            }
        }
    }
}

/// Dispatch one delivery on the current thread. Used both by the run loop
/// for queued messages and by the send path for same-thread shortcuts.
pub(crate) fn dispatch_deliver(cell: &Arc<NodeCell>, msg: &mut Message, cluster: &Arc<ClusterState>) {
    let Some(group) = cell.group() else {
        trace!("delivery to node of dropped group");
        return;
    };
    let Some(topology) = cluster.topology() else {
        trace!("delivery with no active topology");
        return;
    };
    let ctx = NodeCtx::new(cell, &group, &topology, cluster);
    cell.deliver(&ctx, msg);
}
