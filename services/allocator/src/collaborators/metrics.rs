//! Metrics pipeline interface and implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use capacity_id::ExternalNodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{error_from_response, CollaboratorError};

/// A usage reading as reported by the metrics pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub pod_count: u32,

    /// When the pipeline took the reading.
    pub sampled_at: DateTime<Utc>,
}

/// Source of per-node usage readings.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query_usage(
        &self,
        external_id: &ExternalNodeId,
    ) -> Result<UsageSample, CollaboratorError>;
}

/// Metrics pipeline reached over its JSON API.
pub struct HttpMetricsSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMetricsSource {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build metrics HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn query_usage(
        &self,
        external_id: &ExternalNodeId,
    ) -> Result<UsageSample, CollaboratorError> {
        let url = format!("{}/v1/vms/{}/usage", self.base_url, external_id);
        debug!(url = %url, "Querying node usage");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response("query usage", response).await);
        }

        Ok(response.json().await?)
    }
}

/// Metrics source serving readings set by the test.
#[derive(Default)]
pub struct MockMetricsSource {
    samples: Mutex<HashMap<ExternalNodeId, UsageSample>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl MockMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sample(&self, external_id: &ExternalNodeId, sample: UsageSample) {
        lock(&self.samples).insert(external_id.clone(), sample);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl MetricsSource for MockMetricsSource {
    async fn query_usage(
        &self,
        external_id: &ExternalNodeId,
    ) -> Result<UsageSample, CollaboratorError> {
        debug!(external_id = %external_id, "[MOCK] Querying usage");

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable(
                "mock metrics source configured to fail".to_string(),
            ));
        }

        lock(&self.samples)
            .get(external_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(external_id.to_string()))
    }
}
