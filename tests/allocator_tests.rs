//! Allocation decisions across providers, strategies, and failure modes.

mod common;

use common::default_ctx;
use chrono::Utc;
use media_plane::{
    adapters::MemoryAdapter,
    errors::CoreError,
    models::allocation::{
        AllocationContext, ProviderConfig, ProviderProfile, Rule, RuleCondition, RuleOperator,
        RuleValue, StorageStrategy,
    },
    services::allocator::StorageAllocator,
};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

fn provider(name: &str, priority: i32) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        adapter: Arc::new(MemoryAdapter::new()),
        priority,
        enabled: true,
        quota_bytes: None,
        profile: ProviderProfile::default(),
    }
}

fn size_rule(operator: RuleOperator, bytes: u64, provider: &str, priority: i32) -> Rule {
    Rule {
        condition: RuleCondition::FileSize,
        operator,
        value: RuleValue::Number(bytes),
        provider: provider.into(),
        priority,
    }
}

fn strategy(name: &str, rules: Vec<Rule>) -> StorageStrategy {
    StorageStrategy {
        name: name.into(),
        enabled: true,
        rules,
    }
}

#[tokio::test]
async fn matching_rule_routes_away_from_the_default() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));
    allocator.add_provider(provider("small-tier", 5));
    allocator.add_strategy(strategy(
        "small-files",
        vec![size_rule(RuleOperator::Lt, 100 * MIB, "small-tier", 10)],
    ));

    let allocation = allocator
        .allocate("clip.mp4", 50 * MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(allocation.provider, "small-tier");
    assert_eq!(allocation.bucket, "media");
    assert!(allocation.url_expires_at > Utc::now());
}

#[tokio::test]
async fn unmatched_rules_fall_back_to_the_default() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));
    allocator.add_provider(provider("big-tier", 5));
    allocator.add_strategy(strategy(
        "big-files",
        vec![size_rule(RuleOperator::Gte, 100 * MIB, "big-tier", 10)],
    ));

    let allocation = allocator
        .allocate("clip.mp4", 50 * MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(allocation.provider, "default");
}

#[tokio::test]
async fn higher_priority_rules_win() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));
    allocator.add_provider(provider("a", 5));
    allocator.add_provider(provider("b", 5));
    allocator.add_strategy(strategy(
        "overlapping",
        vec![
            size_rule(RuleOperator::Lt, 100 * MIB, "a", 1),
            size_rule(RuleOperator::Lt, 100 * MIB, "b", 20),
        ],
    ));

    let allocation = allocator
        .allocate("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(allocation.provider, "b");
}

#[tokio::test]
async fn disabled_strategies_and_providers_are_skipped() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));
    allocator.add_provider(provider("target", 5));
    allocator.add_strategy(StorageStrategy {
        name: "off".into(),
        enabled: false,
        rules: vec![size_rule(RuleOperator::Lt, 100 * MIB, "target", 10)],
    });

    let allocation = allocator
        .allocate("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(allocation.provider, "default");

    // Even a matching rule cannot route to a disabled provider.
    allocator.add_strategy(strategy(
        "on",
        vec![size_rule(RuleOperator::Lt, 100 * MIB, "target", 10)],
    ));
    allocator.set_provider_enabled("target", false).unwrap();
    let allocation = allocator
        .allocate("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(allocation.provider, "default");
}

#[tokio::test]
async fn no_enabled_provider_is_an_explicit_error() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("only", 10));
    allocator.set_provider_enabled("only", false).unwrap();

    let err = allocator
        .allocate("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ProviderUnavailable(_)));
}

#[tokio::test]
async fn file_type_rules_match_by_extension() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));
    allocator.add_provider(provider("video", 5));
    allocator.add_strategy(strategy(
        "videos",
        vec![Rule {
            condition: RuleCondition::FileType,
            operator: RuleOperator::In,
            value: RuleValue::List(vec!["mp4".into(), "mov".into()]),
            provider: "video".into(),
            priority: 10,
        }],
    ));

    let hit = allocator
        .allocate("clip.MP4", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(hit.provider, "video");

    let miss = allocator
        .allocate("photo.png", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(miss.provider, "default");
}

#[tokio::test]
async fn concurrent_allocations_get_distinct_keys() {
    let allocator = Arc::new(StorageAllocator::new("media"));
    allocator.add_provider(provider("default", 10));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            allocator
                .allocate("same-name.png", MIB, &default_ctx())
                .await
                .unwrap()
                .key
        }));
    }

    let mut keys = Vec::new();
    for handle in handles {
        keys.push(handle.await.unwrap());
    }
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 8, "every allocation must get its own key");
}

#[tokio::test]
async fn keys_embed_the_allocation_context() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));

    let ctx = AllocationContext {
        organization_id: "acme".into(),
        project_id: "site".into(),
        user_id: Some("u42".into()),
        user_tier: None,
    };
    let allocation = allocator.allocate("hero image.png", MIB, &ctx).await.unwrap();
    assert!(allocation.key.starts_with("acme/site/u42/"));
    assert!(allocation.key.ends_with("_hero_image.png"));
}

#[tokio::test]
async fn cost_estimate_scales_with_size() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));

    let small = allocator
        .allocate("a.bin", MIB, &default_ctx())
        .await
        .unwrap();
    let large = allocator
        .allocate("b.bin", 1024 * MIB, &default_ctx())
        .await
        .unwrap();
    assert!(large.cost.total > small.cost.total);
    assert!(
        (large.cost.total - (large.cost.storage + large.cost.transfer + large.cost.requests))
            .abs()
            < 1e-9
    );
}

#[tokio::test]
async fn removing_the_default_provider_clears_it() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("first", 10));
    allocator.add_provider(provider("second", 5));

    // Removing a non-default provider leaves the default intact.
    allocator.remove_provider("second").unwrap();
    let allocation = allocator
        .allocate("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(allocation.provider, "first");

    // Removing the default leaves nothing to fall back to.
    allocator.remove_provider("first").unwrap();
    let err = allocator
        .allocate("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ProviderUnavailable(_)));

    let err = allocator.remove_provider("first").unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn presigned_urls_cover_the_allocation() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("default", 10));

    let presigned = allocator
        .presign_upload("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(presigned.provider, "default");
    assert!(presigned.url.contains(&presigned.key));
    assert!(presigned.url.contains("method=PUT"));
    assert!(presigned.expires_at > Utc::now());

    let download = allocator
        .presign_download("default", &presigned.key)
        .await
        .unwrap();
    assert!(download.url.contains("method=GET"));
    assert!(download.expires_at > Utc::now());

    let err = allocator
        .presign_download("missing", &presigned.key)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn default_provider_can_be_reassigned() {
    let allocator = StorageAllocator::new("media");
    allocator.add_provider(provider("first", 10));
    allocator.add_provider(provider("second", 5));

    allocator.set_default_provider("second").unwrap();
    let allocation = allocator
        .allocate("clip.mp4", MIB, &default_ctx())
        .await
        .unwrap();
    assert_eq!(allocation.provider, "second");

    let summaries = allocator.providers();
    let second = summaries.iter().find(|p| p.name == "second").unwrap();
    assert!(second.is_default);

    let err = allocator.set_default_provider("missing").unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}
