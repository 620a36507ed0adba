//! Topology: the cluster-wide graph of groups, links and placements.
//!
//! A topology is parsed from a textual description (see [`parser`]),
//! activated exactly once, and then replaced wholesale when a new
//! description arrives. Node addressing virtualizes group membership:
//! `node_id = (group_id << 32) | local_index`.

pub mod group;
pub mod link;
pub mod parser;

pub use {
    group::{Group, Placement, ThreadSpec},
    link::{resolve_neighbor, Link},
};

use {
    crate::{
        cluster::ClusterState,
        error::{CommError, Result},
    },
    log::{info, warn},
    std::{collections::HashMap, sync::Arc},
};

/// Compose a full node id from a group id and a node index.
pub fn node_id(group: u32, index: u64) -> i64 {
    ((group as i64) << 32) | ((index & 0xffff_ffff) as i64)
}

/// Split a full node id into its group id and node index halves.
pub fn split_node_id(id: i64) -> (u32, u64) {
    (((id as u64) >> 32) as u32, (id as u64) & 0xffff_ffff)
}

/// The active group graph. Immutable once built; groups carry their own
/// interior mutability for counts and cells.
pub struct Topology {
    groups: Vec<Arc<Group>>,
    by_name: HashMap<String, u32>,
    /// Source text the topology was parsed from, kept for re-flooding.
    description: String,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl Topology {
    pub(crate) fn new(description: &str) -> Self {
        Self {
            groups: Vec::new(),
            by_name: HashMap::new(),
            description: description.to_string(),
        }
    }

    /// Declare a new group; ids are dense in declaration order.
    pub(crate) fn add_group(&mut self, name: &str, node_type: &str) -> Result<Arc<Group>> {
        if self.by_name.contains_key(name) {
            return Err(CommError::DuplicateGroup(name.to_string()));
        }
        let id = self.groups.len() as u32;
        let group = Group::new(id, name, node_type);
        self.by_name.insert(name.to_string(), id);
        self.groups.push(Arc::clone(&group));
        Ok(group)
    }

    pub fn group_by_name(&self, name: &str) -> Result<Arc<Group>> {
        self.by_name
            .get(name)
            .and_then(|&id| self.groups.get(id as usize))
            .cloned()
            .ok_or_else(|| CommError::UnknownGroup(name.to_string()))
    }

    pub fn group_by_id(&self, id: u32) -> Option<Arc<Group>> {
        self.groups.get(id as usize).cloned()
    }

    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    /// Source text this topology was built from.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Resolve a full node id against the local residents of its group.
    pub fn decode_node(&self, id: i64) -> Result<(Arc<Group>, u64)> {
        let (group_id, index) = split_node_id(id);
        let group = self
            .group_by_id(group_id)
            .ok_or(CommError::GroupIdOutOfRange(group_id))?;
        let local = group.nb_local();
        if index >= local {
            return Err(CommError::NodeIndexOverflow {
                group: group.name().to_string(),
                index,
                local,
            });
        }
        Ok((group, index))
    }

    /// Bring the topology to life: instantiate every local resident,
    /// eagerly open data channels to machines our senders will reach, and
    /// release the schedulers.
    pub(crate) fn activate(self: &Arc<Self>, cluster: &Arc<ClusterState>) -> Result<()> {
        for group in &self.groups {
            group.instantiate_local(cluster)?;
        }

        // Machines hosting groups our local nodes send to get their data
        // channel opened now rather than on first send.
        for group in &self.groups {
            if group.nb_local() == 0 {
                continue;
            }
            for link in group.out_links() {
                let Some(dst) = self.group_by_id(link.dst()) else {
                    continue;
                };
                for p in dst.placements() {
                    if p.is_local {
                        continue;
                    }
                    if let Err(e) = cluster.machines().connect(&p.machine, cluster) {
                        warn!("data channel to {} failed: {e}", p.machine);
                        p.errored
                            .store(true, std::sync::atomic::Ordering::Release);
                    }
                }
            }
        }

        for sched in cluster.schedulers() {
            sched.start();
        }
        info!(
            "topology active: {} groups, {} local nodes",
            self.groups.len(),
            self.groups.iter().map(|g| g.nb_local()).sum::<u64>()
        );
        Ok(())
    }
}
