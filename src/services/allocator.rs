//! Storage allocator: picks a provider per upload, generates keys and
//! presigned URLs, and estimates cost/performance.
//!
//! The provider/strategy registry is read-mostly: `allocate` runs on every
//! upload while admin mutations are rare. Readers clone an `Arc` snapshot
//! and writers swap in a rebuilt registry, so an allocation never observes
//! a half-applied mutation.
//!
//! The allocator decides *where* bytes go, never *how many times* a
//! transfer is attempted — retry policy belongs to the upload manager.

use crate::{
    adapters::{PresignedUrl, StorageAdapter, TransferOptions},
    errors::{CoreError, CoreResult},
    models::allocation::{
        AllocationContext, CostEstimate, PerformanceEstimate, ProviderConfig, ProviderProfile,
        Rule, RuleCondition, RuleOperator, RuleValue, StorageAllocation, StorageStrategy,
    },
};
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, info};
use uuid::Uuid;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Files below this size get a score bonus on cheap-storage providers.
const SMALL_FILE_CUTOFF: u64 = 10 * 1024 * 1024;
const CHEAP_STORAGE_RATE: f64 = 0.015;
const SMALL_FILE_BONUS: i32 = 5;
const TIER_AFFINITY_BONUS: i32 = 3;

#[derive(Default)]
struct Registry {
    providers: HashMap<String, ProviderConfig>,
    default_provider: Option<String>,
    strategies: Vec<StorageStrategy>,
}

/// Serializable provider view for the admin surface.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub adapter: &'static str,
    pub priority: i32,
    pub enabled: bool,
    pub is_default: bool,
    pub profile: ProviderProfile,
}

/// Result of `presign_upload`: the allocation decision plus a URL the
/// client can PUT directly to.
#[derive(Clone, Debug, Serialize)]
pub struct PresignedUpload {
    pub provider: String,
    pub key: String,
    pub url: String,
    pub expires_at: chrono::DateTime<Utc>,
}

pub struct StorageAllocator {
    registry: RwLock<Arc<Registry>>,
    /// Logical bucket label stamped onto allocations.
    bucket: String,
}

impl StorageAllocator {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            registry: RwLock::new(Arc::new(Registry::default())),
            bucket: bucket.into(),
        }
    }

    fn snapshot(&self) -> Arc<Registry> {
        self.registry.read().unwrap().clone()
    }

    /// Rebuild the registry under the write lock and swap it in.
    fn mutate(&self, apply: impl FnOnce(&mut Registry)) {
        let mut guard = self.registry.write().unwrap();
        let mut next = Registry {
            providers: guard.providers.clone(),
            default_provider: guard.default_provider.clone(),
            strategies: guard.strategies.clone(),
        };
        apply(&mut next);
        *guard = Arc::new(next);
    }

    /// Register a provider. The first registered provider becomes the
    /// default until `set_default_provider` says otherwise.
    pub fn add_provider(&self, config: ProviderConfig) {
        info!(provider = %config.name, priority = config.priority, "registering storage provider");
        self.mutate(|reg| {
            if reg.default_provider.is_none() {
                reg.default_provider = Some(config.name.clone());
            }
            reg.providers.insert(config.name.clone(), config);
        });
    }

    pub fn remove_provider(&self, name: &str) -> CoreResult<()> {
        let mut removed = false;
        self.mutate(|reg| {
            removed = reg.providers.remove(name).is_some();
            if reg.default_provider.as_deref() == Some(name) {
                reg.default_provider = None;
            }
        });
        if removed {
            Ok(())
        } else {
            Err(CoreError::not_found("provider", name))
        }
    }

    pub fn set_default_provider(&self, name: &str) -> CoreResult<()> {
        let mut found = false;
        self.mutate(|reg| {
            if reg.providers.contains_key(name) {
                reg.default_provider = Some(name.to_string());
                found = true;
            }
        });
        if found {
            Ok(())
        } else {
            Err(CoreError::not_found("provider", name))
        }
    }

    pub fn set_provider_enabled(&self, name: &str, enabled: bool) -> CoreResult<()> {
        let mut found = false;
        self.mutate(|reg| {
            if let Some(provider) = reg.providers.get_mut(name) {
                provider.enabled = enabled;
                found = true;
            }
        });
        if found {
            Ok(())
        } else {
            Err(CoreError::not_found("provider", name))
        }
    }

    pub fn add_strategy(&self, strategy: StorageStrategy) {
        info!(strategy = %strategy.name, rules = strategy.rules.len(), "adding storage strategy");
        self.mutate(|reg| reg.strategies.push(strategy));
    }

    /// Look up the adapter handle for a provider by name.
    pub fn adapter_for(&self, name: &str) -> CoreResult<Arc<dyn StorageAdapter>> {
        self.snapshot()
            .providers
            .get(name)
            .map(|p| p.adapter.clone())
            .ok_or_else(|| CoreError::not_found("provider", name))
    }

    /// Provider listing for the admin surface.
    pub fn providers(&self) -> Vec<ProviderSummary> {
        let reg = self.snapshot();
        let mut out: Vec<ProviderSummary> = reg
            .providers
            .values()
            .map(|p| ProviderSummary {
                name: p.name.clone(),
                adapter: p.adapter.name(),
                priority: p.priority,
                enabled: p.enabled,
                is_default: reg.default_provider.as_deref() == Some(&p.name),
                profile: p.profile.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Choose a provider and produce the full allocation for one upload.
    pub async fn allocate(
        &self,
        file_name: &str,
        file_size: u64,
        ctx: &AllocationContext,
    ) -> CoreResult<StorageAllocation> {
        let reg = self.snapshot();
        let provider = Self::choose_provider(&reg, file_name, file_size, ctx)?;

        let key = generate_key(file_name, ctx);
        let url = provider
            .adapter
            .generate_presigned_upload_url(&key, &TransferOptions::default())
            .await?;

        debug!(provider = %provider.name, key = %key, file_size, "allocated upload");

        Ok(StorageAllocation {
            provider: provider.name.clone(),
            bucket: self.bucket.clone(),
            key,
            url: url.url,
            url_expires_at: url.expires_at,
            cost: estimate_cost(file_size, &provider.profile),
            performance: PerformanceEstimate {
                latency_ms: provider.profile.latency_ms,
                throughput_mbps: provider.profile.throughput_mbps,
                region: provider.profile.region.clone(),
            },
        })
    }

    /// Allocation plus a direct-PUT presigned URL, for clients that bypass
    /// the chunked session path.
    pub async fn presign_upload(
        &self,
        file_name: &str,
        file_size: u64,
        ctx: &AllocationContext,
    ) -> CoreResult<PresignedUpload> {
        let allocation = self.allocate(file_name, file_size, ctx).await?;
        Ok(PresignedUpload {
            provider: allocation.provider,
            key: allocation.key,
            url: allocation.url,
            expires_at: allocation.url_expires_at,
        })
    }

    /// Presigned download URL for an existing key on a known provider.
    pub async fn presign_download(&self, provider: &str, key: &str) -> CoreResult<PresignedUrl> {
        self.adapter_for(provider)?
            .generate_presigned_download_url(key, &TransferOptions::default())
            .await
    }

    /// Evaluate every enabled strategy's rules, score the candidates, and
    /// return the winning provider. Falls back to the default provider when
    /// no rule matches.
    fn choose_provider<'a>(
        reg: &'a Registry,
        file_name: &str,
        file_size: u64,
        ctx: &AllocationContext,
    ) -> CoreResult<&'a ProviderConfig> {
        let file_type = file_type_of(file_name);

        let mut candidates: Vec<(&str, i32, i32)> = Vec::new();
        for strategy in reg.strategies.iter().filter(|s| s.enabled) {
            for rule in &strategy.rules {
                if rule_matches(rule, file_size, &file_type, ctx) {
                    let score = reg
                        .providers
                        .get(&rule.provider)
                        .map(|p| fit_score(file_size, ctx, &p.profile))
                        .unwrap_or(0);
                    candidates.push((rule.provider.as_str(), rule.priority, score));
                }
            }
        }
        candidates.sort_by(|a, b| (b.1, b.2).cmp(&(a.1, a.2)));

        for (name, _, _) in &candidates {
            if let Some(provider) = reg.providers.get(*name).filter(|p| p.enabled) {
                return Ok(provider);
            }
        }

        if let Some(default) = &reg.default_provider {
            if let Some(provider) = reg.providers.get(default).filter(|p| p.enabled) {
                return Ok(provider);
            }
        }

        Err(CoreError::ProviderUnavailable(
            "no rule matched and no enabled default provider is configured".into(),
        ))
    }
}

/// Bonus-based fit score layered on top of rule priority.
fn fit_score(file_size: u64, ctx: &AllocationContext, profile: &ProviderProfile) -> i32 {
    let mut score = 0;
    if file_size < SMALL_FILE_CUTOFF && profile.storage_cost_per_gb < CHEAP_STORAGE_RATE {
        score += SMALL_FILE_BONUS;
    }
    if let (Some(tier), Some(affinity)) = (&ctx.user_tier, &profile.tier_affinity) {
        if tier == affinity {
            score += TIER_AFFINITY_BONUS;
        }
    }
    score
}

/// Evaluate one rule against the request attributes.
fn rule_matches(rule: &Rule, file_size: u64, file_type: &str, ctx: &AllocationContext) -> bool {
    match rule.condition {
        RuleCondition::FileSize => match &rule.value {
            RuleValue::Number(value) => match rule.operator {
                RuleOperator::Lt => file_size < *value,
                RuleOperator::Lte => file_size <= *value,
                RuleOperator::Eq => file_size == *value,
                RuleOperator::Gte => file_size >= *value,
                RuleOperator::Gt => file_size > *value,
                RuleOperator::In | RuleOperator::NotIn => false,
            },
            _ => false,
        },
        RuleCondition::FileType => text_matches(rule, file_type),
        RuleCondition::Organization => text_matches(rule, &ctx.organization_id),
        RuleCondition::Project => text_matches(rule, &ctx.project_id),
        RuleCondition::UserTier => match &ctx.user_tier {
            Some(tier) => text_matches(rule, tier),
            None => false,
        },
    }
}

fn text_matches(rule: &Rule, attr: &str) -> bool {
    match (&rule.operator, &rule.value) {
        (RuleOperator::Eq, RuleValue::Text(value)) => attr == value,
        (RuleOperator::In, RuleValue::List(values)) => values.iter().any(|v| v == attr),
        (RuleOperator::NotIn, RuleValue::List(values)) => !values.iter().any(|v| v == attr),
        _ => false,
    }
}

/// Lowercased extension, or "bin" when the name has none.
fn file_type_of(file_name: &str) -> String {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "bin".into())
}

/// Deterministic, collision-resistant key:
/// `{org}/{project}/[{user}/]{millis}_{suffix}_{name}`. The uuid-derived
/// suffix keeps concurrent allocations within one millisecond distinct.
fn generate_key(file_name: &str, ctx: &AllocationContext) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
    let name = sanitize_file_name(file_name);
    match &ctx.user_id {
        Some(user) => format!(
            "{}/{}/{}/{millis}_{suffix}_{name}",
            ctx.organization_id, ctx.project_id, user
        ),
        None => format!(
            "{}/{}/{millis}_{suffix}_{name}",
            ctx.organization_id, ctx.project_id
        ),
    }
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".into()
    } else {
        cleaned
    }
}

/// Sum of per-GiB storage, per-GiB transfer, and a flat per-request cost.
fn estimate_cost(file_size: u64, profile: &ProviderProfile) -> CostEstimate {
    let gib = file_size as f64 / GIB;
    let storage = gib * profile.storage_cost_per_gb;
    let transfer = gib * profile.transfer_cost_per_gb;
    let requests = profile.request_cost;
    CostEstimate {
        storage,
        transfer,
        requests,
        total: storage + transfer + requests,
    }
}
