//! Integration tests for engine fallback
//!
//! Tests demotion to the in-process engine when the distributed engine
//! fails, identical results in both modes, and background recovery

mod common;

use common::*;
use hybrid_model_cache::{CacheLookup, Engine};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Run a fixed read/write sequence and record every observable result
async fn scenario(cache: &hybrid_model_cache::CacheSystem) -> Vec<String> {
    let db = Arc::new(MemoryStore::with_rows(seed_levels()));
    let levels = cache.model::<UserLevel, _>(Arc::clone(&db));
    let mut log = Vec::new();

    log.push(format!("{:?}", levels.get_one(&by_id(1)).await.ok()));
    log.push(format!("{:?}", levels.get_one(&by_id(1)).await.ok()));
    log.push(format!("{:?}", levels.get_one(&by_id(99)).await.ok()));
    log.push(format!("{:?}", levels.get_all(&by_guild("g1")).await.ok()));
    log.push(format!("{:?}", levels.count(&by_guild("g2")).await.ok()));

    let saved = levels
        .save_and_update_cache(&UserLevel::new(1, "g1", "u1", 555))
        .await
        .ok();
    log.push(format!("{saved:?}"));
    log.push(format!("{:?}", levels.get_one(&by_member("g1", "u1")).await.ok()));
    log.push(format!("{:?}", levels.get_all(&by_guild("g1")).await.ok()));

    let created = levels
        .find_or_create(&by_member("g7", "u7"), &json!({"xp": 1}))
        .await
        .ok();
    log.push(format!("{created:?}"));
    log.push(format!(
        "find_one={} find_all={} count={}",
        db.find_one_calls(),
        db.find_all_calls(),
        db.count_calls()
    ));
    log
}

#[tokio::test]
async fn test_fallback_returns_identical_results() {
    let local = local_system(test_config()).await;
    let remote = Arc::new(FlakyRemote::new());
    let distributed = remote_system(test_config(), Arc::clone(&remote)).await;

    assert_eq!(local.store().engine(), Engine::InProcess);
    assert_eq!(distributed.store().engine(), Engine::Distributed);

    let local_log = scenario(&local).await;
    let distributed_log = scenario(&distributed).await;

    assert_eq!(local_log, distributed_log);
    assert!(remote.len() > 0, "distributed engine should hold the entries");
    assert!(distributed.store().local().is_empty());
}

#[tokio::test]
async fn test_remote_failure_demotes_to_local() {
    let remote = Arc::new(FlakyRemote::new());
    let config = hybrid_model_cache::CacheConfig {
        auto_reconnect: false,
        ..test_config()
    };
    let cache = remote_system(config, Arc::clone(&remote)).await;
    let db = Arc::new(MemoryStore::with_rows(seed_levels()));
    let levels = cache.model::<UserLevel, _>(Arc::clone(&db));

    levels.get_one(&by_id(1)).await.unwrap_or_else(|_| panic!("get_one failed"));
    assert_eq!(db.find_one_calls(), 1);

    remote.set_failing(true);

    // The failed read is a miss, served from the database
    let level = levels.get_one(&by_id(1)).await.unwrap_or_else(|_| panic!("get_one failed"));
    assert_eq!(level.map(|l| l.xp), Some(100));
    assert_eq!(db.find_one_calls(), 2);
    assert!(cache.store().is_degraded());
    assert_eq!(cache.store().health().demotions(), 1);

    // Now cached in-process; the broken remote is no longer touched
    let touched = remote.operations.load(Ordering::SeqCst);
    levels.get_one(&by_id(1)).await.unwrap_or_else(|_| panic!("get_one failed"));
    assert_eq!(db.find_one_calls(), 2);
    assert_eq!(remote.operations.load(Ordering::SeqCst), touched);
    assert!(cache.store().stats().remote_errors >= 1);
}

#[tokio::test]
async fn test_failed_write_hook_still_completes() {
    let remote = Arc::new(FlakyRemote::new());
    let config = hybrid_model_cache::CacheConfig {
        auto_reconnect: false,
        ..test_config()
    };
    let cache = remote_system(config, Arc::clone(&remote)).await;
    let db = Arc::new(MemoryStore::with_rows(seed_levels()));
    let levels = cache.model::<UserLevel, _>(Arc::clone(&db));

    remote.set_failing(true);
    let saved = levels.save_and_update_cache(&UserLevel::new(2, "g1", "u2", 1)).await;
    assert!(saved.is_ok());
    assert!(cache.store().is_degraded());
    assert_eq!(db.rows().iter().find(|l| l.id == 2).map(|l| l.xp), Some(1));
}

#[tokio::test]
async fn test_recovery_restores_distributed_engine() {
    let remote = Arc::new(FlakyRemote::new());
    let cache = remote_system(test_config(), Arc::clone(&remote)).await;
    let db = Arc::new(MemoryStore::with_rows(seed_levels()));
    let levels = cache.model::<UserLevel, _>(Arc::clone(&db));

    remote.set_failing(true);
    levels.get_one(&by_id(3)).await.unwrap_or_else(|_| panic!("get_one failed"));
    assert!(cache.store().is_degraded());
    assert_eq!(cache.store().local().len(), 1);

    remote.set_failing(false);
    let store = Arc::clone(cache.store());
    let restored = wait_for(|| !store.is_degraded(), 1000).await;

    assert!(restored, "distributed engine should be restored");
    assert!(cache.store().local().is_empty(), "in-process entries are dropped on recovery");
    assert_eq!(cache.store().health().reconnects(), 2);

    levels.get_one(&by_id(3)).await.unwrap_or_else(|_| panic!("get_one failed"));
    assert!(remote.len() > 0);
}

/// Entries the distributed engine held before an outage must not outlive a
/// save made while it was unreachable
#[tokio::test]
async fn test_recovery_drops_entries_invalidated_while_degraded() {
    let remote = Arc::new(FlakyRemote::new());
    let cache = remote_system(test_config(), Arc::clone(&remote)).await;
    let db = Arc::new(MemoryStore::with_rows(seed_levels()));
    let levels = cache.model::<UserLevel, _>(Arc::clone(&db));

    let before = levels.get_one(&by_id(1)).await.unwrap_or_else(|_| panic!("get_one failed"));
    assert_eq!(before.map(|l| l.xp), Some(100));
    levels.count(&by_guild("g1")).await.unwrap_or_else(|_| panic!("count failed"));

    remote.set_failing(true);
    levels
        .save_and_update_cache(&UserLevel::new(1, "g1", "u1", 900))
        .await
        .unwrap_or_else(|_| panic!("save failed"));
    assert!(cache.store().is_degraded());
    assert_eq!(cache.store().backlog().prefixes(), vec![levels.namespace()]);

    remote.set_failing(false);
    let store = Arc::clone(cache.store());
    let restored = wait_for(|| !store.is_degraded(), 1000).await;
    assert!(restored, "distributed engine should be restored");
    assert!(cache.store().backlog().is_empty());

    let after = levels.get_one(&by_id(1)).await.unwrap_or_else(|_| panic!("get_one failed"));
    assert_eq!(after.map(|l| l.xp), Some(900));
    assert_eq!(db.find_one_calls(), 2);
    levels.count(&by_guild("g1")).await.unwrap_or_else(|_| panic!("count failed"));
    assert_eq!(db.count_calls(), 2);
}

#[tokio::test]
async fn test_recovery_gives_up_after_retry_budget() {
    let remote = Arc::new(FlakyRemote::new());
    let cache = remote_system(test_config(), Arc::clone(&remote)).await;

    remote.set_failing(true);
    assert_eq!(cache.store().get("v1:UserLevel:x").await, CacheLookup::Miss);
    assert!(cache.store().health().is_recovering());

    let health = cache.store().health().clone();
    let gave_up = wait_for(|| !health.is_recovering(), 1000).await;
    assert!(gave_up);
    assert!(cache.store().is_degraded());
}

#[tokio::test]
async fn test_unreachable_remote_at_startup() {
    let remote = Arc::new(FlakyRemote::failing());
    let cache = remote_system(test_config(), Arc::clone(&remote)).await;

    assert!(cache.store().is_degraded());
    assert!(!cache.health_check().await);

    cache.store().set("k", Some(&json!(1)), Duration::from_secs(60)).await;
    assert_eq!(remote.len(), 0);
    assert!(cache.store().get("k").await.is_hit());
}

#[tokio::test]
async fn test_no_redis_url_means_in_process() {
    let cache = local_system(test_config()).await;
    assert!(!cache.store().has_remote());
    assert!(cache.store().is_degraded());
    assert!(cache.health_check().await);
}

#[cfg(feature = "redis")]
#[tokio::test]
async fn test_unreachable_redis_falls_back() {
    let config = hybrid_model_cache::CacheConfig {
        retry: hybrid_model_cache::RetryPolicy {
            max_retries: 1,
            step: Duration::from_millis(10),
            cap: Duration::from_millis(10),
        },
        ..test_config()
    }
    .with_redis("redis://127.0.0.1:1");

    let cache = local_system(config).await;
    assert!(!cache.store().has_remote());
    assert_eq!(cache.store().engine(), Engine::InProcess);
}
