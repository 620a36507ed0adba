//! Per-node activity counters and cluster-wide introspection snapshots.
//!
//! Counters are plain atomics written by the owning scheduler thread and
//! read by the introspection path. Snapshots are serde structs shipped as
//! JSON between machines; the root keeps a shadow copy per remote machine
//! and merges them into the cluster view on demand.

use {
    serde::{Deserialize, Serialize},
    std::{
        sync::{
            atomic::{AtomicU64, Ordering},
            Mutex,
        },
        time::Instant,
    },
};

/// Activity counters for one resident node.
///
/// Single-writer by construction (only the owning scheduler thread
/// advances a node), so `Relaxed` ordering is sufficient throughout.
#[derive(Debug)]
pub struct NodeTelemetry {
    nb_process: AtomicU64,
    nb_send: AtomicU64,
    nb_recv: AtomicU64,
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    /// Free scalar slots a node body can expose through introspection.
    info_1: AtomicU64,
    info_2: AtomicU64,
    rates: Mutex<RateState>,
}

#[derive(Debug)]
struct RateState {
    sampled_at: Instant,
    last_process: u64,
    last_bytes_out: u64,
    last_bytes_in: u64,
    ips: f64,
    kb_out: f64,
    kb_in: f64,
}

impl Default for NodeTelemetry {
    fn default() -> Self {
        Self {
            nb_process: AtomicU64::new(0),
            nb_send: AtomicU64::new(0),
            nb_recv: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            info_1: AtomicU64::new(0f64.to_bits()),
            info_2: AtomicU64::new(0f64.to_bits()),
            rates: Mutex::new(RateState {
                sampled_at: Instant::now(),
                last_process: 0,
                last_bytes_out: 0,
                last_bytes_in: 0,
                ips: 0.0,
                kb_out: 0.0,
                kb_in: 0.0,
            }),
        }
    }
}

impl NodeTelemetry {
    /// Count one completed `process` tick.
    pub fn record_process(&self) {
        self.nb_process.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one outbound message of `bytes` payload.
    pub fn record_send(&self, bytes: u64) {
        self.nb_send.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count one inbound message of `bytes` payload.
    pub fn record_recv(&self, bytes: u64) {
        self.nb_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total completed `process` ticks.
    pub fn nb_process(&self) -> u64 {
        self.nb_process.load(Ordering::Relaxed)
    }

    /// Expose a scalar through the first free introspection slot.
    pub fn set_info_1(&self, v: f64) {
        self.info_1.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Expose a scalar through the second free introspection slot.
    pub fn set_info_2(&self, v: f64) {
        self.info_2.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Recompute per-second rates from the deltas since the last call.
    pub fn sample_rates(&self) {
        let now = Instant::now();
        let nb_process = self.nb_process.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let mut rates = match self.rates.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = now.duration_since(rates.sampled_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        rates.ips = (nb_process.saturating_sub(rates.last_process)) as f64 / elapsed;
        rates.kb_out = (bytes_out.saturating_sub(rates.last_bytes_out)) as f64 / elapsed / 1024.0;
        rates.kb_in = (bytes_in.saturating_sub(rates.last_bytes_in)) as f64 / elapsed / 1024.0;
        rates.sampled_at = now;
        rates.last_process = nb_process;
        rates.last_bytes_out = bytes_out;
        rates.last_bytes_in = bytes_in;
    }

    /// Current counters and rates for one node.
    pub fn snapshot(&self, index: u64, attached: bool) -> NodeSnapshot {
        let rates = match self.rates.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        NodeSnapshot {
            index,
            attached,
            nb_process: self.nb_process.load(Ordering::Relaxed),
            nb_send: self.nb_send.load(Ordering::Relaxed),
            nb_recv: self.nb_recv.load(Ordering::Relaxed),
            ips: rates.ips,
            kb_out: rates.kb_out,
            kb_in: rates.kb_in,
            info_1: f64::from_bits(self.info_1.load(Ordering::Relaxed)),
            info_2: f64::from_bits(self.info_2.load(Ordering::Relaxed)),
        }
    }
}

// ── Snapshot wire types ─────────────────────────────────────────────────────

/// Counters for one node at one sample point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub index: u64,
    pub attached: bool,
    pub nb_process: u64,
    pub nb_send: u64,
    pub nb_recv: u64,
    pub ips: f64,
    pub kb_out: f64,
    pub kb_in: f64,
    pub info_1: f64,
    pub info_2: f64,
}

/// Aggregated counters for one group's residents on one machine, plus the
/// per-node samples they were folded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group: String,
    pub nb_nodes: u64,
    pub nb_attached: u64,
    pub nb_process: u64,
    pub ips: f64,
    pub kb_out: f64,
    pub kb_in: f64,
    pub info_1: f64,
    pub info_2: f64,
    pub nodes: Vec<NodeSnapshot>,
}

/// One machine's view of its resident nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub machine: String,
    pub groups: Vec<GroupSnapshot>,
}

/// The root's merged cluster view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub machines: Vec<MachineSnapshot>,
}

impl GroupSnapshot {
    /// Fold one node's sample into the group aggregate, keeping the sample
    /// itself in the per-node list.
    pub fn fold(&mut self, node: &NodeSnapshot) {
        self.nb_nodes += 1;
        if node.attached {
            self.nb_attached += 1;
        }
        self.nb_process += node.nb_process;
        self.ips += node.ips;
        self.kb_out += node.kb_out;
        self.kb_in += node.kb_in;
        self.info_1 += node.info_1;
        self.info_2 += node.info_2;
        self.nodes.push(node.clone());
    }

    /// Empty aggregate for a group.
    pub fn empty(group: &str) -> Self {
        Self {
            group: group.to_string(),
            nb_nodes: 0,
            nb_attached: 0,
            nb_process: 0,
            ips: 0.0,
            kb_out: 0.0,
            kb_in: 0.0,
            info_1: 0.0,
            info_2: 0.0,
            nodes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let t = NodeTelemetry::default();
        t.record_process();
        t.record_process();
        t.record_send(100);
        t.record_recv(50);
        let snap = t.snapshot(3, true);
        assert_eq!(snap.nb_process, 2);
        assert_eq!(snap.nb_send, 1);
        assert_eq!(snap.nb_recv, 1);
        assert_eq!(snap.index, 3);
        assert!(snap.attached);
    }

    #[test]
    fn test_info_slots() {
        let t = NodeTelemetry::default();
        t.set_info_1(1.5);
        t.set_info_2(-2.25);
        let snap = t.snapshot(0, false);
        assert_eq!(snap.info_1, 1.5);
        assert_eq!(snap.info_2, -2.25);
    }

    #[test]
    fn test_rates_nonnegative() {
        let t = NodeTelemetry::default();
        for _ in 0..10 {
            t.record_process();
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        t.sample_rates();
        let snap = t.snapshot(0, true);
        assert!(snap.ips > 0.0);
        assert_eq!(snap.kb_out, 0.0);
    }

    #[test]
    fn test_group_fold() {
        let mut g = GroupSnapshot::empty("alpha");
        let t = NodeTelemetry::default();
        t.record_process();
        g.fold(&t.snapshot(0, true));
        g.fold(&t.snapshot(1, false));
        assert_eq!(g.nb_nodes, 2);
        assert_eq!(g.nb_attached, 1);
        assert_eq!(g.nb_process, 2);
        // Aggregates ride alongside the per-node samples, not instead of
        // them.
        assert_eq!(g.nodes.len(), 2);
        assert_eq!(g.nodes[0].index, 0);
        assert!(g.nodes[0].attached);
        assert_eq!(g.nodes[1].index, 1);
        assert!(!g.nodes[1].attached);
    }

    #[test]
    fn test_group_snapshot_json_carries_nodes() {
        let mut g = GroupSnapshot::empty("alpha");
        let t = NodeTelemetry::default();
        t.set_info_1(4.5);
        g.fold(&t.snapshot(2, true));
        let json = serde_json::to_string(&g).unwrap();
        let back: GroupSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nodes.len(), 1);
        assert_eq!(back.nodes[0].index, 2);
        assert_eq!(back.nodes[0].info_1, 4.5);
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snap = ClusterSnapshot {
            machines: vec![MachineSnapshot {
                machine: "m0".to_string(),
                groups: vec![GroupSnapshot::empty("alpha")],
            }],
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: ClusterSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.machines.len(), 1);
        assert_eq!(back.machines[0].groups[0].group, "alpha");
    }
}
