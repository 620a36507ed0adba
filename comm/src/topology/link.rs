//! Directed group-to-group links.
//!
//! Links are stored by group id and resolved through the owning
//! [`Topology`](crate::topology::Topology) at every use, so out-degrees
//! always reflect the destination group's current counts.

use crate::topology::Topology;

/// One directed edge between two groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    src: u32,
    dst: u32,
    /// On a self-link, whether a node may reach itself.
    allow_self: bool,
    /// Restrict reachability to nodes resident on this machine.
    local_only: bool,
}

impl Link {
    pub fn new(src: u32, dst: u32, allow_self: bool, local_only: bool) -> Self {
        Self {
            src,
            dst,
            allow_self,
            local_only,
        }
    }

    pub fn src(&self) -> u32 {
        self.src
    }

    pub fn dst(&self) -> u32 {
        self.dst
    }

    pub fn allow_self(&self) -> bool {
        self.allow_self
    }

    pub fn local_only(&self) -> bool {
        self.local_only
    }

    /// True when source and destination are the same group.
    pub fn is_self_link(&self) -> bool {
        self.src == self.dst
    }

    /// Number of nodes reachable over this link, computed live.
    ///
    /// A self-link that forbids self-delivery excludes the sender, so the
    /// degree is one less than the group size (zero for empty or
    /// single-node groups).
    pub fn out_degree(&self, topology: &Topology) -> u64 {
        let Some(dst) = topology.group_by_id(self.dst) else {
            return 0;
        };
        let n = if self.local_only {
            dst.nb_local()
        } else {
            dst.nb_nodes()
        };
        if self.is_self_link() && !self.allow_self {
            n.saturating_sub(1)
        } else {
            n
        }
    }
}

/// Map a neighbor ordinal to a destination node index, skipping the
/// sender's own slot when self-delivery is forbidden.
///
/// With `allow_self`, the mapping is the identity. Without it, ordinals at
/// or past `self_index` shift up by one, giving a bijection from
/// `[0, size-1)` onto `[0, size) \ {self_index}`.
pub fn resolve_neighbor(neighbor: u64, self_index: u64, size: u64, allow_self: bool) -> u64 {
    debug_assert!(if allow_self {
        neighbor < size
    } else {
        neighbor < size.saturating_sub(1)
    });
    if allow_self || neighbor < self_index {
        neighbor
    } else {
        neighbor + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_identity_when_self_allowed() {
        for i in 0..5 {
            assert_eq!(resolve_neighbor(i, 2, 5, true), i);
        }
    }

    #[test]
    fn test_resolve_skips_self() {
        // self_index 2 in a group of 5: ordinals map onto {0,1,3,4}.
        assert_eq!(resolve_neighbor(0, 2, 5, false), 0);
        assert_eq!(resolve_neighbor(1, 2, 5, false), 1);
        assert_eq!(resolve_neighbor(2, 2, 5, false), 3);
        assert_eq!(resolve_neighbor(3, 2, 5, false), 4);
    }

    #[test]
    fn test_resolve_is_bijection() {
        let size = 17u64;
        for self_index in 0..size {
            let mut seen: Vec<u64> = (0..size - 1)
                .map(|n| resolve_neighbor(n, self_index, size, false))
                .collect();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len() as u64, size - 1);
            assert!(!seen.contains(&self_index));
            assert!(seen.iter().all(|&t| t < size));
        }
    }

    #[test]
    fn test_resolve_edge_positions() {
        // Sender at position 0: every ordinal shifts.
        assert_eq!(resolve_neighbor(0, 0, 3, false), 1);
        assert_eq!(resolve_neighbor(1, 0, 3, false), 2);
        // Sender at the last position: identity over the valid range.
        assert_eq!(resolve_neighbor(0, 2, 3, false), 0);
        assert_eq!(resolve_neighbor(1, 2, 3, false), 1);
    }
}
