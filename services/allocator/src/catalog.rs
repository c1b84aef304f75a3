//! Plan catalog.
//!
//! Plans are static, versioned configuration loaded from TOML. The catalog
//! is validated once at load time and is read-only afterwards, so it can be
//! shared freely behind an `Arc`.
//!
//! Every catalog carries a content digest computed from a canonical JSON
//! rendering of the TOML document, so two files that differ only in
//! formatting or key order hash the same.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{CapacityError, CapacityResult};

/// The catalog that ships with the engine.
const BUILTIN_CATALOG: &str = include_str!("../config/plans.toml");

pub const MILLIS_PER_CORE: i64 = 1000;
pub const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

/// Errors raised while loading a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to canonicalize catalog: {0}")]
    Canonicalize(#[from] serde_json::Error),

    #[error("duplicate plan id: {0}")]
    DuplicatePlan(String),

    #[error("plan {plan_id}: {reason}")]
    InvalidPlan { plan_id: String, reason: String },

    #[error("default plan {0} must be an existing, non-retired shared plan")]
    InvalidDefault(String),
}

/// Whether a plan draws from a shared pool or owns dedicated nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Shared,
    Dedicated,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Dedicated => "dedicated",
        }
    }
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources a plan grants: the whole pool for shared plans, one node for
/// dedicated plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub cpu_cores: i32,
    pub memory_gb: i32,
    pub storage_gb: i32,
    pub max_pods: i32,
    pub max_services: i32,
}

impl ResourceEnvelope {
    /// CPU limit in millicores.
    pub fn cpu_millis(&self) -> i64 {
        i64::from(self.cpu_cores) * MILLIS_PER_CORE
    }

    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_gb) * BYTES_PER_GB
    }
}

fn default_node_count() -> u32 {
    1
}

/// A purchasable capacity tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub kind: PlanKind,
    pub resources: ResourceEnvelope,
    pub price_per_month: f64,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub features: Vec<String>,

    /// Dedicated nodes granted by the plan. Ignored for shared plans.
    #[serde(default = "default_node_count")]
    pub node_count: u32,

    /// Retired plans are hidden from listings but still resolve by id.
    #[serde(default)]
    pub retired: bool,
}

impl Plan {
    pub fn is_shared(&self) -> bool {
        self.kind == PlanKind::Shared
    }

    pub fn is_dedicated(&self) -> bool {
        self.kind == PlanKind::Dedicated
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidPlan {
            plan_id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.resources.cpu_cores <= 0 {
            return Err(invalid("cpu_cores must be positive"));
        }
        if self.resources.memory_gb <= 0 {
            return Err(invalid("memory_gb must be positive"));
        }
        if self.resources.storage_gb <= 0 {
            return Err(invalid("storage_gb must be positive"));
        }
        if self.resources.max_pods < 0 || self.resources.max_services < 0 {
            return Err(invalid("pod and service limits must not be negative"));
        }
        if !self.price_per_month.is_finite() || self.price_per_month < 0.0 {
            return Err(invalid("price_per_month must be a non-negative number"));
        }
        if self.is_dedicated() && self.node_count == 0 {
            return Err(invalid("dedicated plans need at least one node"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    version: u32,
    default_plan: String,
    plans: Vec<Plan>,
}

/// The validated set of plans.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    version: u32,
    digest: String,
    default_plan: String,
    plans: BTreeMap<String, Plan>,
}

impl PlanCatalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, CatalogError> {
        let digest = catalog_digest(contents)?;
        let file: CatalogFile = toml::from_str(contents)?;

        let mut seen = HashSet::new();
        let mut plans = BTreeMap::new();
        for plan in file.plans {
            plan.validate()?;
            if !seen.insert(plan.id.clone()) {
                return Err(CatalogError::DuplicatePlan(plan.id));
            }
            plans.insert(plan.id.clone(), plan);
        }

        match plans.get(&file.default_plan) {
            Some(plan) if plan.is_shared() && !plan.retired => {}
            _ => return Err(CatalogError::InvalidDefault(file.default_plan)),
        }

        Ok(Self {
            version: file.version,
            digest,
            default_plan: file.default_plan,
            plans,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// `sha256:<hex>` over the canonical form of the catalog.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Purchasable plans, cheapest first.
    pub fn list_plans(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self
            .plans
            .values()
            .filter(|plan| !plan.retired)
            .cloned()
            .collect();
        plans.sort_by(|a, b| {
            a.price_per_month
                .total_cmp(&b.price_per_month)
                .then_with(|| a.id.cmp(&b.id))
        });
        plans
    }

    /// Resolves a plan by id, including retired plans.
    pub fn get_plan(&self, plan_id: &str) -> CapacityResult<Plan> {
        self.plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| CapacityError::PlanNotFound(plan_id.to_string()))
    }

    /// The shared plan new workspaces start on.
    pub fn baseline_plan(&self) -> &Plan {
        // Presence is checked in `from_toml_str`.
        &self.plans[&self.default_plan]
    }
}

fn catalog_digest(contents: &str) -> Result<String, CatalogError> {
    let value: toml::Value = toml::from_str(contents)?;
    let canonical = serde_json::to_vec(&serde_json::to_value(&value)?)?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
version = 2
default_plan = "basic"

[[plans]]
id = "basic"
name = "Basic"
kind = "shared"
price_per_month = 0.0
resources = { cpu_cores = 1, memory_gb = 2, storage_gb = 10, max_pods = 5, max_services = 2 }

[[plans]]
id = "big"
name = "Big"
kind = "dedicated"
price_per_month = 10.0
node_count = 3
resources = { cpu_cores = 8, memory_gb = 32, storage_gb = 100, max_pods = 50, max_services = 20 }

[[plans]]
id = "legacy"
name = "Legacy"
kind = "dedicated"
price_per_month = 5.0
retired = true
resources = { cpu_cores = 2, memory_gb = 4, storage_gb = 50, max_pods = 10, max_services = 5 }
"#;

    #[test]
    fn test_builtin_catalog() {
        let catalog = PlanCatalog::builtin().unwrap();
        let ids: Vec<String> = catalog.list_plans().into_iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            vec!["shared-plan", "s-type-plan", "m-type-plan", "l-type-plan"]
        );

        let baseline = catalog.baseline_plan();
        assert_eq!(baseline.id, "shared-plan");
        assert_eq!(baseline.resources.cpu_millis(), 2_000);
        assert_eq!(baseline.resources.memory_bytes(), 4 * BYTES_PER_GB);

        let m = catalog.get_plan("m-type-plan").unwrap();
        assert_eq!(m.kind, PlanKind::Dedicated);
        assert_eq!(m.node_count, 1);
        assert_eq!(m.resources.cpu_cores, 8);
    }

    #[test]
    fn test_unknown_plan() {
        let catalog = PlanCatalog::builtin().unwrap();
        let err = catalog.get_plan("xl-type-plan").unwrap_err();
        assert!(matches!(err, CapacityError::PlanNotFound(id) if id == "xl-type-plan"));
    }

    #[test]
    fn test_retired_plans_hidden_but_resolvable() {
        let catalog = PlanCatalog::from_toml_str(SMALL).unwrap();
        let ids: Vec<String> = catalog.list_plans().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["basic", "big"]);
        assert!(catalog.get_plan("legacy").unwrap().retired);
        assert_eq!(catalog.version(), 2);
    }

    #[test]
    fn test_digest_ignores_formatting() {
        let a = PlanCatalog::from_toml_str(SMALL).unwrap();
        let reformatted = SMALL.replace(" = ", "=").replace("\n\n", "\n");
        let b = PlanCatalog::from_toml_str(&reformatted).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert!(a.digest().starts_with("sha256:"));
        assert_eq!(a.digest().len(), "sha256:".len() + 64);

        let c = PlanCatalog::from_toml_str(&SMALL.replace("version = 2", "version = 3")).unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_rejects_duplicate_plan() {
        let doubled = format!(
            "{SMALL}\n[[plans]]\nid = \"basic\"\nname = \"Again\"\nkind = \"shared\"\nprice_per_month = 1.0\nresources = {{ cpu_cores = 1, memory_gb = 1, storage_gb = 1, max_pods = 1, max_services = 1 }}\n"
        );
        let err = PlanCatalog::from_toml_str(&doubled).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicatePlan(id) if id == "basic"));
    }

    #[test]
    fn test_rejects_bad_envelope() {
        let bad = SMALL.replace("cpu_cores = 8", "cpu_cores = 0");
        let err = PlanCatalog::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidPlan { plan_id, .. } if plan_id == "big"));
    }

    #[test]
    fn test_rejects_dedicated_default() {
        let bad = SMALL.replace("default_plan = \"basic\"", "default_plan = \"big\"");
        let err = PlanCatalog::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidDefault(id) if id == "big"));
    }

    #[rstest::rstest]
    #[case("shared-plan", PlanKind::Shared, 2, 4)]
    #[case("s-type-plan", PlanKind::Dedicated, 4, 16)]
    #[case("m-type-plan", PlanKind::Dedicated, 8, 32)]
    #[case("l-type-plan", PlanKind::Dedicated, 16, 64)]
    fn test_builtin_plans(
        #[case] plan_id: &str,
        #[case] kind: PlanKind,
        #[case] cpu_cores: i32,
        #[case] memory_gb: i32,
    ) {
        let catalog = PlanCatalog::builtin().unwrap();
        let plan = catalog.get_plan(plan_id).unwrap();
        assert_eq!(plan.kind, kind);
        assert_eq!(plan.resources.cpu_cores, cpu_cores);
        assert_eq!(plan.resources.memory_gb, memory_gb);
        assert_eq!(plan.node_count, 1);
    }
}
