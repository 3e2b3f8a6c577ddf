//! `modelgrid.toml` settings.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration for a single local node.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::duration_str;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub eligibility: EligibilitySettings,
    pub deploy: DeploySettings,
    pub reconcile: ReconcileSettings,
    pub cluster: ClusterSettings,
    pub engine: EngineSettings,
}

/// Placement policy consulted on every deploy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilitySettings {
    /// Node names that never receive artifacts.
    pub exclude_node_names: Vec<String>,
    /// Restrict `dedicated_category` artifacts to nodes with `dedicated_role`.
    pub only_run_on_dedicated: bool,
    pub dedicated_role: String,
    pub dedicated_category: String,
    /// Role allow-list per artifact category.
    pub category_roles: BTreeMap<String, Vec<String>>,
    /// Allow-list for categories missing from `category_roles`.
    pub default_roles: Vec<String>,
    /// Whether callers may name explicit target nodes.
    pub allow_custom_placement: bool,
    pub data_role: String,
    /// Node attribute carrying the cost tier of a data node.
    pub tier_attribute: String,
    /// Tier values treated as the default tier. A data node without the
    /// attribute is also default tier.
    pub default_tiers: Vec<String>,
}

impl Default for EligibilitySettings {
    fn default() -> Self {
        let mut category_roles = BTreeMap::new();
        category_roles.insert("remote".to_string(), vec!["data".into(), "ml".into()]);
        category_roles.insert("local".to_string(), vec!["data".into(), "ml".into()]);
        Self {
            exclude_node_names: Vec::new(),
            only_run_on_dedicated: true,
            dedicated_role: "ml".to_string(),
            dedicated_category: "local".to_string(),
            category_roles,
            default_roles: vec!["data".into(), "ml".into()],
            allow_custom_placement: false,
            data_role: "data".to_string(),
            tier_attribute: "box_type".to_string(),
            default_tiers: vec!["hot".to_string()],
        }
    }
}

impl EligibilitySettings {
    /// Allowed roles for a category, falling back to `default_roles`.
    pub fn roles_for(&self, category: &str) -> &[String] {
        self.category_roles
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_roles)
    }
}

/// Per-node deploy pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Materializations running at once on one node.
    pub max_concurrent_deploys: usize,
    /// Commands allowed to wait for a free slot before new ones are refused.
    pub max_queued_deploys: usize,
    /// Upper bound on one engine materialization. Zero means no bound.
    #[serde(with = "duration_str")]
    pub materialize_timeout: Duration,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            max_concurrent_deploys: 4,
            max_queued_deploys: 16,
            materialize_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Sweep interval. Zero disables the sweep.
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// How long a fresh deploy or task is left alone before the sweep judges it.
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    /// Bounded wait for a per-record mutation permit.
    #[serde(with = "duration_str")]
    pub permit_timeout: Duration,
    /// Timeout for one node request.
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            grace_period: Duration::from_secs(20),
            permit_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Members started by the in-process cluster.
    pub nodes: Vec<NodeSettings>,
    /// Members silent for longer than this are reaped.
    #[serde(with = "duration_str")]
    pub dead_timeout: Duration,
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            nodes: vec![NodeSettings {
                id: "node-0".to_string(),
                name: "node-0".to_string(),
                roles: vec!["cluster_manager".into(), "data".into(), "ml".into()],
                attributes: BTreeMap::new(),
            }],
            dead_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding `<artifact_id>.bin` payloads.
    pub model_dir: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
