//! Wiring for the engine's components.
//!
//! The ledger and the coordinator share one set of workspace locks, so a
//! reservation and a plan change on the same workspace never interleave.

use std::sync::Arc;
use std::time::Duration;

use capacity_id::WorkspaceId;
use capacity_reconcile::ResizeStrategy;

use crate::catalog::PlanCatalog;
use crate::collaborators::{Hypervisor, MetricsSource};
use crate::config::EngineConfig;
use crate::coordinator::AllocationCoordinator;
use crate::ledger::QuotaLedger;
use crate::locks::KeyedLocks;
use crate::observer::UsageObserver;
use crate::reconciler::Reconciler;
use crate::recorder::EventRecorder;
use crate::registry::NodeRegistry;
use crate::store::Store;

#[derive(Clone)]
pub struct CapacityEngine {
    catalog: Arc<PlanCatalog>,
    store: Arc<dyn Store>,
    recorder: EventRecorder,
    ledger: QuotaLedger,
    registry: NodeRegistry,
    observer: UsageObserver,
    coordinator: AllocationCoordinator,
    workspace_locks: Arc<KeyedLocks<WorkspaceId>>,
}

impl CapacityEngine {
    pub fn new(
        catalog: Arc<PlanCatalog>,
        store: Arc<dyn Store>,
        hypervisor: Arc<dyn Hypervisor>,
        metrics: Arc<dyn MetricsSource>,
        config: &EngineConfig,
    ) -> Self {
        let workspace_locks = Arc::new(KeyedLocks::new());
        let recorder = EventRecorder::new(store.clone());
        let ledger = QuotaLedger::new(
            store.clone(),
            recorder.clone(),
            workspace_locks.clone(),
            config.max_write_attempts,
        );
        let registry = NodeRegistry::new(store.clone(), recorder.clone(), hypervisor, config);
        let observer = UsageObserver::new(
            store.clone(),
            metrics,
            config.metrics_timeout,
            config.usage_max_staleness,
        );
        let coordinator = AllocationCoordinator::new(
            store.clone(),
            catalog.clone(),
            ledger.clone(),
            registry.clone(),
            observer.clone(),
            recorder.clone(),
            workspace_locks.clone(),
            ResizeStrategy {
                min_active: config.min_active_nodes,
            },
        );

        Self {
            catalog,
            store,
            recorder,
            ledger,
            registry,
            observer,
            coordinator,
            workspace_locks,
        }
    }

    /// A reconciler over this engine's nodes.
    pub fn reconciler(&self, pending_grace: Duration) -> Reconciler {
        Reconciler::new(
            self.registry.clone(),
            self.coordinator.clone(),
            self.workspace_locks.clone(),
            pending_grace,
        )
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn observer(&self) -> &UsageObserver {
        &self.observer
    }

    pub fn coordinator(&self) -> &AllocationCoordinator {
        &self.coordinator
    }
}
