//! Shared harness for integration tests.
//!
//! Builds an engine over the in-memory store and mock collaborators, with
//! timeouts short enough that failure paths finish quickly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use capacity_allocator::catalog::PlanCatalog;
use capacity_allocator::collaborators::{MockHypervisor, MockMetricsSource};
use capacity_allocator::config::EngineConfig;
use capacity_allocator::engine::CapacityEngine;
use capacity_allocator::model::WorkspaceAllocation;
use capacity_allocator::store::MemoryStore;
use capacity_events::{NodeEvent, NodeLifecycleState};

/// Catalog with two shared tiers and two dedicated plans of the same shape.
pub const TEST_CATALOG: &str = r#"
version = 7
default_plan = "shared-plan"

[[plans]]
id = "shared-plan"
name = "Shared"
kind = "shared"
price_per_month = 0.0
[plans.resources]
cpu_cores = 2
memory_gb = 4
storage_gb = 100
max_pods = 50
max_services = 10

[[plans]]
id = "shared-mini"
name = "Shared Mini"
kind = "shared"
price_per_month = 0.0
[plans.resources]
cpu_cores = 1
memory_gb = 2
storage_gb = 50
max_pods = 20
max_services = 5

[[plans]]
id = "shared-pro"
name = "Shared Pro"
kind = "shared"
price_per_month = 19.0
[plans.resources]
cpu_cores = 4
memory_gb = 8
storage_gb = 100
max_pods = 80
max_services = 20

[[plans]]
id = "s-type-plan"
name = "S-Type Dedicated"
kind = "dedicated"
price_per_month = 99.99
[plans.resources]
cpu_cores = 4
memory_gb = 16
storage_gb = 200
max_pods = 100
max_services = 50

[[plans]]
id = "m-type-plan"
name = "M-Type Dedicated"
kind = "dedicated"
price_per_month = 199.99
[plans.resources]
cpu_cores = 8
memory_gb = 32
storage_gb = 500
max_pods = 250
max_services = 100

[[plans]]
id = "m-type-trio"
name = "M-Type Dedicated x3"
kind = "dedicated"
price_per_month = 599.97
node_count = 3
[plans.resources]
cpu_cores = 8
memory_gb = 32
storage_gb = 500
max_pods = 250
max_services = 100

[[plans]]
id = "legacy-shared"
name = "Legacy"
kind = "shared"
price_per_month = 5.0
retired = true
[plans.resources]
cpu_cores = 1
memory_gb = 1
storage_gb = 10
max_pods = 5
max_services = 1
"#;

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        provision_timeout: Duration::from_secs(2),
        status_poll_interval: Duration::from_millis(5),
        hypervisor_timeout: Duration::from_millis(500),
        metrics_timeout: Duration::from_millis(200),
        usage_max_staleness: Duration::from_secs(60),
        max_write_attempts: 5,
        min_active_nodes: 1,
    }
}

pub struct Harness {
    pub engine: CapacityEngine,
    pub store: Arc<MemoryStore>,
    pub hypervisor: Arc<MockHypervisor>,
    pub metrics: Arc<MockMetricsSource>,
}

impl Harness {
    /// Engine over the test catalog.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let catalog = PlanCatalog::from_toml_str(TEST_CATALOG).expect("test catalog parses");
        Self::build(catalog, config)
    }

    /// Engine over the catalog shipped with the binary.
    pub fn builtin() -> Self {
        let catalog = PlanCatalog::builtin().expect("built-in catalog parses");
        Self::build(catalog, fast_config())
    }

    fn build(catalog: PlanCatalog, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let hypervisor = Arc::new(MockHypervisor::new());
        let metrics = Arc::new(MockMetricsSource::new());
        let engine = CapacityEngine::new(
            Arc::new(catalog),
            store.clone(),
            hypervisor.clone(),
            metrics.clone(),
            &config,
        );
        Self {
            engine,
            store,
            hypervisor,
            metrics,
        }
    }
}

/// Exactly one of shared quota and dedicated nodes.
pub fn assert_exclusive(allocation: &WorkspaceAllocation) {
    assert!(
        allocation.is_consistent(),
        "allocation holds both or neither capacity kind: {allocation:?}"
    );
    assert_ne!(
        allocation.shared_quota().is_some(),
        !allocation.dedicated_node_ids().is_empty(),
        "allocation {allocation:?} is not exclusive"
    );
}

/// Lifecycle states a node's events moved it through, oldest first.
pub fn lifecycle_of(events: &[NodeEvent]) -> Vec<NodeLifecycleState> {
    let mut states: Vec<_> = events
        .iter()
        .filter_map(|e| e.event_type.resulting_state())
        .collect();
    states.reverse();
    states
}
