//! Storage allocation decisions, provider configuration, and routing rules.

use crate::adapters::StorageAdapter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The decision of which provider/key/URL a given upload will use.
///
/// Created once per upload and owned by the session for its lifetime.
/// Immutable except for presigned-URL expiry.
#[derive(Clone, Debug, Serialize)]
pub struct StorageAllocation {
    /// Name of the chosen provider.
    pub provider: String,

    /// Logical bucket on that provider.
    pub bucket: String,

    /// Generated object key (unique per allocation).
    pub key: String,

    /// Presigned upload URL for the whole object.
    pub url: String,

    /// When the presigned URL stops being valid.
    pub url_expires_at: DateTime<Utc>,

    /// Heuristic monthly cost breakdown for this file on this provider.
    pub cost: CostEstimate,

    /// Static performance profile of the provider.
    pub performance: PerformanceEstimate,
}

/// Heuristic cost breakdown in USD. The per-provider rates are configuration,
/// not measured values.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CostEstimate {
    pub storage: f64,
    pub transfer: f64,
    pub requests: f64,
    pub total: f64,
}

/// Static latency/throughput/region tuple for a provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformanceEstimate {
    pub latency_ms: u32,
    pub throughput_mbps: u32,
    pub region: String,
}

/// Hand-tuned pricing and performance constants for one provider.
///
/// Treated as configurable parameters; nothing asserts on exact values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// USD per GB-month of storage.
    pub storage_cost_per_gb: f64,

    /// USD per GB of egress/ingress transfer.
    pub transfer_cost_per_gb: f64,

    /// Flat USD per request.
    pub request_cost: f64,

    pub latency_ms: u32,
    pub throughput_mbps: u32,
    pub region: String,

    /// User tier this provider is a natural fit for (scoring bonus).
    pub tier_affinity: Option<String>,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            storage_cost_per_gb: 0.023,
            transfer_cost_per_gb: 0.09,
            request_cost: 0.000_005,
            latency_ms: 50,
            throughput_mbps: 500,
            region: "local".into(),
            tier_affinity: None,
        }
    }
}

/// A registered storage provider: the adapter handle plus routing metadata.
#[derive(Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub adapter: Arc<dyn StorageAdapter>,
    pub priority: i32,
    pub enabled: bool,
    /// Optional quota in bytes; informational, enforced by the provider.
    pub quota_bytes: Option<u64>,
    pub profile: ProviderProfile,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("adapter", &self.adapter.name())
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("quota_bytes", &self.quota_bytes)
            .finish()
    }
}

/// Attribute a rule's condition inspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleCondition {
    FileSize,
    FileType,
    Organization,
    Project,
    UserTier,
}

/// Comparison applied between the attribute and the rule value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleOperator {
    Lt,
    Lte,
    Eq,
    Gte,
    Gt,
    In,
    NotIn,
}

/// Rule comparison value; numeric for file-size rules, text or list otherwise.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Number(u64),
    Text(String),
    List(Vec<String>),
}

/// One routing rule: condition, operator, value, and the provider it elects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub condition: RuleCondition,
    pub operator: RuleOperator,
    pub value: RuleValue,
    pub provider: String,
    pub priority: i32,
}

/// A named, ordered set of rules mapping request attributes to providers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageStrategy {
    pub name: String,
    pub enabled: bool,
    pub rules: Vec<Rule>,
}

/// Request attributes evaluated during allocation. Identifiers come from the
/// external metadata store; the core does not validate them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocationContext {
    pub organization_id: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub user_tier: Option<String>,
}
