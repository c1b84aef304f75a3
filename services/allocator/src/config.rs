use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::store::DbConfig;

/// Timeouts and limits the engine applies to its own operations.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for bringing one node from creation to active.
    pub provision_timeout: Duration,

    /// Delay between hypervisor status polls while a node boots.
    pub status_poll_interval: Duration,

    /// Upper bound for a single hypervisor delete or status call.
    pub hypervisor_timeout: Duration,

    /// Upper bound for a single metrics query.
    pub metrics_timeout: Duration,

    /// Usage samples older than this are reported as stale.
    pub usage_max_staleness: Duration,

    /// Attempts at a versioned write before giving up on conflicts.
    pub max_write_attempts: u32,

    /// Active nodes a dedicated workspace keeps while resizing.
    pub min_active_nodes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(600),
            status_poll_interval: Duration::from_secs(5),
            hypervisor_timeout: Duration::from_secs(30),
            metrics_timeout: Duration::from_secs(5),
            usage_max_staleness: Duration::from_secs(120),
            max_write_attempts: 5,
            min_active_nodes: 1,
        }
    }
}

/// Which persistence backend the binary uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub store_backend: StoreBackend,
    pub database: DbConfig,

    /// Catalog file; the built-in catalog is used when unset.
    pub catalog_path: Option<PathBuf>,

    pub hypervisor_url: String,
    pub metrics_url: String,

    /// Use in-process mock collaborators instead of HTTP ones.
    pub mock_collaborators: bool,

    pub engine: EngineConfig,
    pub reconcile_interval: Duration,
    pub pending_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level =
            std::env::var("CAPACITY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = env_flag("CAPACITY_DEV");
        let mock_collaborators = env_flag("CAPACITY_MOCK_COLLABORATORS");

        let store_backend = match std::env::var("CAPACITY_STORE").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => anyhow::bail!("CAPACITY_STORE must be 'postgres' or 'memory', got '{other}'"),
        };

        let catalog_path = std::env::var("CAPACITY_CATALOG_PATH").ok().map(PathBuf::from);

        let hypervisor_url = std::env::var("CAPACITY_HYPERVISOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8006".to_string());
        let metrics_url = std::env::var("CAPACITY_METRICS_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9100".to_string());

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            provision_timeout: env_secs("CAPACITY_PROVISION_TIMEOUT_SECS", defaults.provision_timeout)?,
            status_poll_interval: env_millis(
                "CAPACITY_STATUS_POLL_INTERVAL_MS",
                defaults.status_poll_interval,
            )?,
            hypervisor_timeout: env_secs("CAPACITY_HYPERVISOR_TIMEOUT_SECS", defaults.hypervisor_timeout)?,
            metrics_timeout: env_secs("CAPACITY_METRICS_TIMEOUT_SECS", defaults.metrics_timeout)?,
            usage_max_staleness: env_secs(
                "CAPACITY_USAGE_MAX_STALENESS_SECS",
                defaults.usage_max_staleness,
            )?,
            ..defaults
        };

        let reconcile_interval = env_secs(
            "CAPACITY_RECONCILE_INTERVAL_SECS",
            capacity_reconcile::DEFAULT_RECONCILE_INTERVAL,
        )?;
        let pending_grace = env_secs(
            "CAPACITY_PENDING_GRACE_SECS",
            capacity_reconcile::DEFAULT_PENDING_GRACE,
        )?;

        let database = DbConfig::from_env();

        Ok(Self {
            log_level,
            dev_mode,
            store_backend,
            database,
            catalog_path,
            hypervisor_url,
            metrics_url,
            mock_collaborators,
            engine,
            reconcile_interval,
            pending_grace,
        })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map(Duration::from_secs)
            .with_context(|| format!("{name} must be a whole number of seconds")),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map(Duration::from_millis)
            .with_context(|| format!("{name} must be a whole number of milliseconds")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.provision_timeout, Duration::from_secs(600));
        assert_eq!(config.min_active_nodes, 1);
        assert!(config.max_write_attempts > 1);
    }

    #[test]
    fn test_env_secs_falls_back_to_default() {
        let value = env_secs("CAPACITY_TEST_UNSET_VARIABLE", Duration::from_secs(7)).unwrap();
        assert_eq!(value, Duration::from_secs(7));
    }
}
