//! Hypervisor interface and implementations.
//!
//! The hypervisor physically creates and destroys the VMs behind dedicated
//! nodes. The engine only asks it three things: create a VM, delete a VM,
//! and report a VM's status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use capacity_id::{ExternalNodeId, NodeId, WorkspaceId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{error_from_response, CollaboratorError};
use crate::catalog::{Plan, ResourceEnvelope};

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: NodeId,
    pub workspace_id: WorkspaceId,
    pub plan_id: String,
    pub resources: ResourceEnvelope,
}

impl NodeSpec {
    pub fn for_plan(node_id: NodeId, workspace_id: WorkspaceId, plan: &Plan) -> Self {
        Self {
            node_id,
            workspace_id,
            plan_id: plan.id.clone(),
            resources: plan.resources,
        }
    }
}

/// VM status as the hypervisor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorStatus {
    Creating,
    Running,
    Stopped,
    Failed,
    /// The hypervisor has no such VM.
    Missing,
    /// The hypervisor could not be asked.
    Unknown,
}

impl HypervisorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Missing => "missing",
            Self::Unknown => "unknown",
        }
    }

    /// The VM will never become running without intervention.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Missing)
    }
}

impl std::fmt::Display for HypervisorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hypervisor interface.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Create a VM and return the handle the hypervisor assigned.
    async fn create_node(&self, spec: &NodeSpec) -> Result<ExternalNodeId, CollaboratorError>;

    /// Delete a VM. `NotFound` means it is already gone.
    async fn delete_node(&self, external_id: &ExternalNodeId) -> Result<(), CollaboratorError>;

    /// Current status of a VM. A VM the hypervisor does not know is
    /// reported as [`HypervisorStatus::Missing`].
    async fn node_status(
        &self,
        external_id: &ExternalNodeId,
    ) -> Result<HypervisorStatus, CollaboratorError>;
}

// =============================================================================
// HTTP client
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateNodeResponse {
    external_id: String,
}

#[derive(Debug, Deserialize)]
struct NodeStatusResponse {
    status: HypervisorStatus,
}

/// Hypervisor reached over its JSON API.
pub struct HttpHypervisor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHypervisor {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build hypervisor HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Hypervisor for HttpHypervisor {
    async fn create_node(&self, spec: &NodeSpec) -> Result<ExternalNodeId, CollaboratorError> {
        let url = format!("{}/v1/vms", self.base_url);
        debug!(url = %url, node_id = %spec.node_id, "Creating VM");

        let response = self.client.post(&url).json(spec).send().await?;
        if !response.status().is_success() {
            let err = error_from_response("create VM", response).await;
            error!(node_id = %spec.node_id, error = %err, "Hypervisor rejected VM creation");
            return Err(err);
        }

        let body: CreateNodeResponse = response.json().await?;
        ExternalNodeId::parse(body.external_id)
            .map_err(|e| CollaboratorError::Rejected(format!("invalid external id: {e}")))
    }

    async fn delete_node(&self, external_id: &ExternalNodeId) -> Result<(), CollaboratorError> {
        let url = format!("{}/v1/vms/{}", self.base_url, external_id);
        debug!(url = %url, "Deleting VM");

        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response("delete VM", response).await);
        }
        Ok(())
    }

    async fn node_status(
        &self,
        external_id: &ExternalNodeId,
    ) -> Result<HypervisorStatus, CollaboratorError> {
        let url = format!("{}/v1/vms/{}/status", self.base_url, external_id);

        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(HypervisorStatus::Missing);
        }
        if !response.status().is_success() {
            return Err(error_from_response("VM status", response).await);
        }

        let body: NodeStatusResponse = response.json().await?;
        Ok(body.status)
    }
}

// =============================================================================
// Mock
// =============================================================================

/// In-process hypervisor for tests and development.
///
/// VMs report `Creating` for the configured number of status polls and
/// `Running` afterwards, unless a status is forced with [`Self::set_status`].
pub struct MockHypervisor {
    /// Counter for generating external ids.
    vm_counter: AtomicU64,

    vms: Mutex<HashMap<ExternalNodeId, MockVm>>,

    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
    unreachable: AtomicBool,
    polls_until_running: AtomicU32,
    create_delay: Mutex<Duration>,
    delete_delay: Mutex<Duration>,
}

#[derive(Debug, Clone)]
struct MockVm {
    spec: NodeSpec,
    polls_left: u32,
    forced: Option<HypervisorStatus>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            vm_counter: AtomicU64::new(100),
            vms: Mutex::new(HashMap::new()),
            fail_creates: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            polls_until_running: AtomicU32::new(0),
            create_delay: Mutex::new(Duration::ZERO),
            delete_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// A mock hypervisor that rejects every create.
    pub fn failing() -> Self {
        let mock = Self::new();
        mock.set_fail_creates(true);
        mock
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Makes status queries fail as if the hypervisor were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Status polls a new VM answers with `Creating` before `Running`.
    pub fn set_polls_until_running(&self, polls: u32) {
        self.polls_until_running.store(polls, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        *lock(&self.delete_delay) = delay;
    }

    /// Forces the status of an existing VM.
    pub fn set_status(&self, external_id: &ExternalNodeId, status: HypervisorStatus) {
        if let Some(vm) = lock(&self.vms).get_mut(external_id) {
            vm.forced = Some(status);
        }
    }

    /// Drops a VM behind the engine's back.
    pub fn forget(&self, external_id: &ExternalNodeId) {
        lock(&self.vms).remove(external_id);
    }

    /// Number of VMs that currently exist.
    pub fn vm_count(&self) -> usize {
        lock(&self.vms).len()
    }

    /// Total VMs ever created.
    pub fn created_count(&self) -> u64 {
        self.vm_counter.load(Ordering::SeqCst) - 100
    }

    pub fn spec_of(&self, external_id: &ExternalNodeId) -> Option<NodeSpec> {
        lock(&self.vms).get(external_id).map(|vm| vm.spec.clone())
    }

    fn next_external_id(&self) -> Result<ExternalNodeId, CollaboratorError> {
        let counter = self.vm_counter.fetch_add(1, Ordering::SeqCst);
        ExternalNodeId::parse(format!("mock-vm-{counter}"))
            .map_err(|e| CollaboratorError::Rejected(e.to_string()))
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn create_node(&self, spec: &NodeSpec) -> Result<ExternalNodeId, CollaboratorError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected(
                "mock hypervisor configured to fail".to_string(),
            ));
        }

        info!(
            node_id = %spec.node_id,
            plan_id = %spec.plan_id,
            cpu_cores = spec.resources.cpu_cores,
            memory_gb = spec.resources.memory_gb,
            "[MOCK] Creating VM"
        );

        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let external_id = self.next_external_id()?;
        lock(&self.vms).insert(
            external_id.clone(),
            MockVm {
                spec: spec.clone(),
                polls_left: self.polls_until_running.load(Ordering::SeqCst),
                forced: None,
            },
        );
        debug!(node_id = %spec.node_id, external_id = %external_id, "[MOCK] VM created");

        Ok(external_id)
    }

    async fn delete_node(&self, external_id: &ExternalNodeId) -> Result<(), CollaboratorError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable(
                "mock hypervisor configured to fail deletes".to_string(),
            ));
        }

        info!(external_id = %external_id, "[MOCK] Deleting VM");

        let delay = *lock(&self.delete_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match lock(&self.vms).remove(external_id) {
            Some(_) => Ok(()),
            None => Err(CollaboratorError::NotFound(external_id.to_string())),
        }
    }

    async fn node_status(
        &self,
        external_id: &ExternalNodeId,
    ) -> Result<HypervisorStatus, CollaboratorError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable(
                "mock hypervisor unreachable".to_string(),
            ));
        }

        let mut vms = lock(&self.vms);
        let Some(vm) = vms.get_mut(external_id) else {
            return Ok(HypervisorStatus::Missing);
        };

        if let Some(forced) = vm.forced {
            return Ok(forced);
        }
        if vm.polls_left > 0 {
            vm.polls_left -= 1;
            return Ok(HypervisorStatus::Creating);
        }
        Ok(HypervisorStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanCatalog;

    fn spec() -> NodeSpec {
        let plan = PlanCatalog::builtin().unwrap().get_plan("s-type-plan").unwrap();
        NodeSpec::for_plan(NodeId::new(), WorkspaceId::new(), &plan)
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let hypervisor = MockHypervisor::new();
        hypervisor.set_polls_until_running(1);

        let external_id = hypervisor.create_node(&spec()).await.unwrap();
        assert_eq!(hypervisor.vm_count(), 1);
        assert_eq!(
            hypervisor.node_status(&external_id).await.unwrap(),
            HypervisorStatus::Creating
        );
        assert_eq!(
            hypervisor.node_status(&external_id).await.unwrap(),
            HypervisorStatus::Running
        );

        hypervisor.delete_node(&external_id).await.unwrap();
        assert_eq!(
            hypervisor.node_status(&external_id).await.unwrap(),
            HypervisorStatus::Missing
        );
        assert!(hypervisor
            .delete_node(&external_id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let hypervisor = MockHypervisor::failing();
        let err = hypervisor.create_node(&spec()).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(_)));
        assert_eq!(hypervisor.created_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_status() {
        let hypervisor = MockHypervisor::new();
        let external_id = hypervisor.create_node(&spec()).await.unwrap();
        hypervisor.set_status(&external_id, HypervisorStatus::Failed);
        assert!(hypervisor
            .node_status(&external_id)
            .await
            .unwrap()
            .is_terminal_failure());
    }
}
