//! Usage observer.
//!
//! Read-only view of what a node is consuming right now. Readings come from
//! the metrics pipeline; when it cannot answer in time, or answers with an
//! old sample, the caller gets an error instead of a guess.

use std::sync::Arc;
use std::time::Duration;

use capacity_id::NodeId;
use chrono::Utc;
use tracing::{debug, warn};

use crate::collaborators::MetricsSource;
use crate::error::{CapacityError, CapacityResult};
use crate::model::ResourceUsage;
use crate::store::Store;

#[derive(Clone)]
pub struct UsageObserver {
    store: Arc<dyn Store>,
    metrics: Arc<dyn MetricsSource>,
    timeout: Duration,
    max_staleness: Duration,
}

impl UsageObserver {
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<dyn MetricsSource>,
        timeout: Duration,
        max_staleness: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            timeout,
            max_staleness,
        }
    }

    pub async fn get_usage(&self, node_id: NodeId) -> CapacityResult<ResourceUsage> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(CapacityError::NodeNotFound(node_id))?;

        let unavailable = |reason: String| CapacityError::UsageUnavailable { node_id, reason };

        if node.state.is_deleted() {
            return Err(unavailable("node is deleted".to_string()));
        }
        let Some(external_id) = node.external_id else {
            return Err(unavailable("node is not bound to a VM yet".to_string()));
        };

        let sample = match tokio::time::timeout(self.timeout, self.metrics.query_usage(&external_id))
            .await
        {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!(node_id = %node_id, error = %e, "Usage query failed");
                return Err(unavailable(e.to_string()));
            }
            Err(_) => {
                warn!(node_id = %node_id, timeout = ?self.timeout, "Usage query timed out");
                return Err(unavailable(format!("metrics query timed out after {:?}", self.timeout)));
            }
        };

        let age = (Utc::now() - sample.sampled_at).to_std().unwrap_or_default();
        if age > self.max_staleness {
            debug!(node_id = %node_id, age = ?age, "Usage sample is stale");
            return Err(CapacityError::UsageStale { node_id, age });
        }

        Ok(ResourceUsage {
            node_id,
            cpu_cores: sample.cpu_cores,
            memory_gb: sample.memory_gb,
            storage_gb: sample.storage_gb,
            pod_count: sample.pod_count,
            observed_at: sample.sampled_at,
        })
    }
}
