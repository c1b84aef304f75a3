//! Convergence primitives for dedicated node sets.
//!
//! A workspace on a dedicated plan owns a set of nodes. Changing the size of
//! that set follows an expand-before-contract discipline:
//!
//! - **Expand**: provision every node the new size needs and wait until each
//!   is active.
//! - **Contract**: only then decommission surplus nodes, never taking the
//!   active count below the floor.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - A contract step never leaves fewer than `min_active` active nodes
//! - Nothing is decommissioned while additions are still outstanding

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Resize policy for a dedicated node set.
#[derive(Debug, Clone)]
pub struct ResizeStrategy {
    /// Active nodes that must remain at every instant of a contraction.
    pub min_active: u32,
}

impl Default for ResizeStrategy {
    fn default() -> Self {
        Self { min_active: 1 }
    }
}

/// What a single resize pass should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResizeActions {
    /// Nodes to create and bring to active.
    pub to_provision: u32,

    /// Nodes that may be decommissioned now.
    pub to_decommission: u32,
}

impl ResizeActions {
    pub fn is_noop(&self) -> bool {
        self.to_provision == 0 && self.to_decommission == 0
    }
}

impl ResizeStrategy {
    /// Calculates the next resize step.
    ///
    /// `active` counts nodes ready to serve, `pending` counts nodes still
    /// being provisioned. Pending nodes count toward the target so retries
    /// do not over-provision, but they never count as capacity a
    /// contraction may rely on.
    pub fn calculate_actions(&self, desired: u32, active: u32, pending: u32) -> ResizeActions {
        let in_flight = active + pending;
        let to_provision = desired.saturating_sub(in_flight);

        // Contract only once every addition has become active.
        if to_provision > 0 || pending > 0 {
            return ResizeActions {
                to_provision,
                to_decommission: 0,
            };
        }

        let floor = desired.max(self.min_active);
        ResizeActions {
            to_provision: 0,
            to_decommission: active.saturating_sub(floor),
        }
    }
}

/// Decommission selection priority for nodes.
///
/// Lower priority values are decommissioned first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecommissionPriority {
    /// Node never became active (take it first; it serves nothing).
    NotActive = 0,

    /// Node is active and was created before the others.
    Oldest = 1,

    /// Node is active and recent (take it last).
    Newest = 2,
}

/// Orders nodes for decommissioning, first to go first.
///
/// The sort is stable, so callers pass nodes oldest-first to make ties
/// resolve toward the oldest node.
pub fn select_for_decommission<T, F>(nodes: Vec<T>, get_priority: F) -> Vec<T>
where
    F: Fn(&T) -> DecommissionPriority,
{
    let mut with_priority: Vec<_> = nodes.into_iter().map(|n| (get_priority(&n), n)).collect();
    with_priority.sort_by_key(|(p, _)| *p);
    with_priority.into_iter().map(|(_, n)| n).collect()
}

/// Retry tracker for reconciliation attempts that keep failing.
///
/// Keys are whatever identifies a resource to the caller (node IDs, usually).
#[derive(Debug, Clone)]
pub struct RetryTracker<K: Ord> {
    max_retries: u32,
    window: Duration,
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Records a failure. Returns true once retries are exhausted.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();
        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn is_exhausted(&self, key: &K) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drops entries whose window has elapsed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= window);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a node may sit in a pending state before reconciliation acts on it.
pub const DEFAULT_PENDING_GRACE: Duration = Duration::from_secs(10 * 60);

/// Default retry limit per node within a window.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(30 * 60);
