//! Postgres store.
//!
//! Optimistic concurrency is expressed as `UPDATE ... WHERE version = $n`;
//! an update that matches no row is a version conflict. Schema lives in
//! `migrations/` and is applied with [`Database::run_migrations`].

use std::time::Duration;

use async_trait::async_trait;
use capacity_events::{NewNodeEvent, NodeEvent, NodeEventType, NodeLifecycleState};
use capacity_id::{AllocationId, EventSeq, ExternalNodeId, NodeEventId, NodeId, WorkspaceId};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::{Store, StoreError, StoreResult};
use crate::model::{AllocationCapacity, DedicatedNode, SharedQuota, WorkspaceAllocation};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/capacity".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/capacity".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations, looking for the directory in the usual places.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/allocator/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(StoreError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// [`Store`] over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// Row mapping
// =============================================================================

const ALLOCATION_COLUMNS: &str = "id, workspace_id, plan_id, plan_kind, cpu_limit_millis, \
     memory_limit_bytes, cpu_used_millis, memory_used_bytes, dedicated_node_ids, version, \
     created_at, updated_at";

const NODE_COLUMNS: &str =
    "id, workspace_id, external_id, plan_id, state, version, created_at, updated_at, deleted_at";

const EVENT_COLUMNS: &str = "seq, id, node_id, workspace_id, event_type, occurred_at, detail";

fn corrupt(entity: &'static str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        entity,
        detail: detail.to_string(),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn allocation_from_row(row: &PgRow) -> StoreResult<WorkspaceAllocation> {
    let id: String = row.try_get("id").map_err(StoreError::Query)?;
    let workspace_id: String = row.try_get("workspace_id").map_err(StoreError::Query)?;
    let plan_kind: String = row.try_get("plan_kind").map_err(StoreError::Query)?;

    let capacity = match plan_kind.as_str() {
        "shared" => {
            let get = |column: &str| -> StoreResult<i64> {
                row.try_get::<Option<i64>, _>(column)
                    .map_err(StoreError::Query)?
                    .ok_or_else(|| corrupt("allocation", format!("{id}: {column} is null")))
            };
            AllocationCapacity::Shared {
                quota: SharedQuota {
                    cpu_limit_millis: get("cpu_limit_millis")?,
                    memory_limit_bytes: get("memory_limit_bytes")?,
                    cpu_used_millis: get("cpu_used_millis")?,
                    memory_used_bytes: get("memory_used_bytes")?,
                },
            }
        }
        "dedicated" => {
            let node_ids: Option<serde_json::Value> =
                row.try_get("dedicated_node_ids").map_err(StoreError::Query)?;
            let node_ids: Vec<NodeId> = serde_json::from_value(
                node_ids.ok_or_else(|| corrupt("allocation", format!("{id}: no node ids")))?,
            )?;
            AllocationCapacity::Dedicated { node_ids }
        }
        other => return Err(corrupt("allocation", format!("{id}: plan_kind {other}"))),
    };

    Ok(WorkspaceAllocation {
        id: AllocationId::parse(&id).map_err(|e| corrupt("allocation", e))?,
        workspace_id: WorkspaceId::parse(&workspace_id).map_err(|e| corrupt("allocation", e))?,
        plan_id: row.try_get("plan_id").map_err(StoreError::Query)?,
        capacity,
        version: row.try_get("version").map_err(StoreError::Query)?,
        created_at: row.try_get("created_at").map_err(StoreError::Query)?,
        updated_at: row.try_get("updated_at").map_err(StoreError::Query)?,
    })
}

/// Column values for the capacity of an allocation.
struct CapacityColumns {
    plan_kind: &'static str,
    quota: Option<SharedQuota>,
    node_ids: Option<serde_json::Value>,
}

impl CapacityColumns {
    fn of(allocation: &WorkspaceAllocation) -> StoreResult<Self> {
        Ok(match &allocation.capacity {
            AllocationCapacity::Shared { quota } => Self {
                plan_kind: "shared",
                quota: Some(*quota),
                node_ids: None,
            },
            AllocationCapacity::Dedicated { node_ids } => Self {
                plan_kind: "dedicated",
                quota: None,
                node_ids: Some(serde_json::to_value(node_ids)?),
            },
        })
    }
}

fn node_from_row(row: &PgRow) -> StoreResult<DedicatedNode> {
    let id: String = row.try_get("id").map_err(StoreError::Query)?;
    let workspace_id: String = row.try_get("workspace_id").map_err(StoreError::Query)?;
    let external_id: Option<String> = row.try_get("external_id").map_err(StoreError::Query)?;
    let state: String = row.try_get("state").map_err(StoreError::Query)?;

    Ok(DedicatedNode {
        id: NodeId::parse(&id).map_err(|e| corrupt("node", e))?,
        workspace_id: WorkspaceId::parse(&workspace_id).map_err(|e| corrupt("node", e))?,
        external_id: external_id
            .map(ExternalNodeId::parse)
            .transpose()
            .map_err(|e| corrupt("node", e))?,
        plan_id: row.try_get("plan_id").map_err(StoreError::Query)?,
        state: state
            .parse::<NodeLifecycleState>()
            .map_err(|e| corrupt("node", e))?,
        version: row.try_get("version").map_err(StoreError::Query)?,
        created_at: row.try_get("created_at").map_err(StoreError::Query)?,
        updated_at: row.try_get("updated_at").map_err(StoreError::Query)?,
        deleted_at: row.try_get("deleted_at").map_err(StoreError::Query)?,
    })
}

fn event_from_row(row: &PgRow) -> StoreResult<NodeEvent> {
    let id: String = row.try_get("id").map_err(StoreError::Query)?;
    let node_id: Option<String> = row.try_get("node_id").map_err(StoreError::Query)?;
    let workspace_id: String = row.try_get("workspace_id").map_err(StoreError::Query)?;
    let event_type: String = row.try_get("event_type").map_err(StoreError::Query)?;
    let seq: i64 = row.try_get("seq").map_err(StoreError::Query)?;
    let timestamp: DateTime<Utc> = row.try_get("occurred_at").map_err(StoreError::Query)?;

    Ok(NodeEvent {
        id: NodeEventId::parse(&id).map_err(|e| corrupt("event", e))?,
        seq: EventSeq::new(seq),
        node_id: node_id
            .as_deref()
            .map(NodeId::parse)
            .transpose()
            .map_err(|e| corrupt("event", e))?,
        workspace_id: WorkspaceId::parse(&workspace_id).map_err(|e| corrupt("event", e))?,
        event_type: event_type
            .parse::<NodeEventType>()
            .map_err(|e| corrupt("event", e))?,
        timestamp,
        detail: row.try_get("detail").map_err(StoreError::Query)?,
    })
}

// =============================================================================
// Store implementation
// =============================================================================

#[async_trait]
impl Store for PgStore {
    async fn get_allocation(
        &self,
        workspace_id: WorkspaceId,
    ) -> StoreResult<Option<WorkspaceAllocation>> {
        let row = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM workspace_allocations WHERE workspace_id = $1"
        ))
        .bind(workspace_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        row.as_ref().map(allocation_from_row).transpose()
    }

    async fn insert_allocation(
        &self,
        allocation: &WorkspaceAllocation,
    ) -> StoreResult<WorkspaceAllocation> {
        let columns = CapacityColumns::of(allocation)?;

        sqlx::query(
            r#"
            INSERT INTO workspace_allocations (
                id, workspace_id, plan_id, plan_kind,
                cpu_limit_millis, memory_limit_bytes, cpu_used_millis, memory_used_bytes,
                dedicated_node_ids, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (workspace_id) DO NOTHING
            "#,
        )
        .bind(allocation.id.to_string())
        .bind(allocation.workspace_id.to_string())
        .bind(&allocation.plan_id)
        .bind(columns.plan_kind)
        .bind(columns.quota.map(|q| q.cpu_limit_millis))
        .bind(columns.quota.map(|q| q.memory_limit_bytes))
        .bind(columns.quota.map(|q| q.cpu_used_millis))
        .bind(columns.quota.map(|q| q.memory_used_bytes))
        .bind(columns.node_ids)
        .bind(allocation.version)
        .bind(allocation.created_at)
        .bind(allocation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        self.get_allocation(allocation.workspace_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "allocation",
                id: allocation.workspace_id.to_string(),
            })
    }

    async fn update_allocation(
        &self,
        allocation: &WorkspaceAllocation,
    ) -> StoreResult<WorkspaceAllocation> {
        let columns = CapacityColumns::of(allocation)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE workspace_allocations
            SET plan_id = $3,
                plan_kind = $4,
                cpu_limit_millis = $5,
                memory_limit_bytes = $6,
                cpu_used_millis = $7,
                memory_used_bytes = $8,
                dedicated_node_ids = $9,
                updated_at = $10,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {ALLOCATION_COLUMNS}
            "#
        ))
        .bind(allocation.id.to_string())
        .bind(allocation.version)
        .bind(&allocation.plan_id)
        .bind(columns.plan_kind)
        .bind(columns.quota.map(|q| q.cpu_limit_millis))
        .bind(columns.quota.map(|q| q.memory_limit_bytes))
        .bind(columns.quota.map(|q| q.cpu_used_millis))
        .bind(columns.quota.map(|q| q.memory_used_bytes))
        .bind(columns.node_ids)
        .bind(allocation.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        match row {
            Some(row) => allocation_from_row(&row),
            None => Err(StoreError::VersionConflict {
                entity: "allocation",
                id: allocation.id.to_string(),
                expected: allocation.version,
            }),
        }
    }

    async fn insert_node(&self, node: &DedicatedNode) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dedicated_nodes (
                id, workspace_id, external_id, plan_id, state, version,
                created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.workspace_id.to_string())
        .bind(node.external_id.as_ref().map(|e| e.as_str().to_string()))
        .bind(&node.plan_id)
        .bind(node.state.as_str())
        .bind(node.version)
        .bind(node.created_at)
        .bind(node.updated_at)
        .bind(node.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::Duplicate {
                    entity: "node",
                    detail: node.id.to_string(),
                };
            }
            StoreError::Query(e)
        })?;
        Ok(())
    }

    async fn update_node(&self, node: &DedicatedNode) -> StoreResult<DedicatedNode> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE dedicated_nodes
            SET external_id = $3,
                state = $4,
                updated_at = $5,
                deleted_at = $6,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {NODE_COLUMNS}
            "#
        ))
        .bind(node.id.to_string())
        .bind(node.version)
        .bind(node.external_id.as_ref().map(|e| e.as_str().to_string()))
        .bind(node.state.as_str())
        .bind(node.updated_at)
        .bind(node.deleted_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::Duplicate {
                    entity: "node external id",
                    detail: format!(
                        "{} in {}",
                        node.external_id
                            .as_ref()
                            .map(|e| e.as_str())
                            .unwrap_or_default(),
                        node.workspace_id
                    ),
                };
            }
            StoreError::Query(e)
        })?;

        match row {
            Some(row) => node_from_row(&row),
            None => Err(StoreError::VersionConflict {
                entity: "node",
                id: node.id.to_string(),
                expected: node.version,
            }),
        }
    }

    async fn get_node(&self, node_id: NodeId) -> StoreResult<Option<DedicatedNode>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM dedicated_nodes WHERE id = $1"
        ))
        .bind(node_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        row.as_ref().map(node_from_row).transpose()
    }

    async fn find_node_by_external_id(
        &self,
        workspace_id: WorkspaceId,
        external_id: &ExternalNodeId,
    ) -> StoreResult<Option<DedicatedNode>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM dedicated_nodes WHERE workspace_id = $1 AND external_id = $2"
        ))
        .bind(workspace_id.to_string())
        .bind(external_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        row.as_ref().map(node_from_row).transpose()
    }

    async fn list_nodes(
        &self,
        workspace_id: WorkspaceId,
        include_deleted: bool,
    ) -> StoreResult<Vec<DedicatedNode>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {NODE_COLUMNS} FROM dedicated_nodes
            WHERE workspace_id = $1 AND ($2 OR state <> 'deleted')
            ORDER BY created_at, id
            "#
        ))
        .bind(workspace_id.to_string())
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        rows.iter().map(node_from_row).collect()
    }

    async fn list_nodes_in_states(
        &self,
        states: &[NodeLifecycleState],
    ) -> StoreResult<Vec<DedicatedNode>> {
        let states: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM dedicated_nodes WHERE state = ANY($1) ORDER BY created_at, id"
        ))
        .bind(&states)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        rows.iter().map(node_from_row).collect()
    }

    async fn append_event(&self, event: NewNodeEvent) -> StoreResult<NodeEvent> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO node_events (id, node_id, workspace_id, event_type, occurred_at, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING seq
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.node_id.map(|id| id.to_string()))
        .bind(event.workspace_id.to_string())
        .bind(event.event_type.as_str())
        .bind(event.timestamp)
        .bind(&event.detail)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        Ok(event.into_stored(EventSeq::new(seq)))
    }

    async fn list_node_events(
        &self,
        node_id: NodeId,
        limit: usize,
    ) -> StoreResult<Vec<NodeEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM node_events WHERE node_id = $1 ORDER BY seq DESC LIMIT $2"
        ))
        .bind(node_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_workspace_events(
        &self,
        workspace_id: WorkspaceId,
        limit: usize,
    ) -> StoreResult<Vec<NodeEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM node_events WHERE workspace_id = $1 ORDER BY seq DESC LIMIT $2"
        ))
        .bind(workspace_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }
}
