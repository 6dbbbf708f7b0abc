//! End-to-end cache scenarios against a real temporary directory

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use pagecache::cache::{entry_path, is_expired, Cache, CacheEntry, CacheError, CacheStats};
use pagecache::{CancelReason, Context};
use tempfile::TempDir;

async fn create_test_cache() -> (Cache, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let cache = Cache::open(temp_dir.path())
        .await
        .expect("Failed to open cache");
    (cache, temp_dir)
}

fn stats(hits: u64, misses: u64, size: usize) -> CacheStats {
    CacheStats { hits, misses, size }
}

#[tokio::test]
async fn test_entry_expires_after_its_ttl() {
    let (cache, _temp_dir) = create_test_cache().await;
    let ctx = Context::new();

    cache
        .set(&ctx, "p1", "x", TimeDelta::seconds(2))
        .await
        .expect("set should succeed");

    let value: String = cache.get(&ctx, "p1").await.expect("fresh entry");
    assert_eq!(value, "x");
    assert_eq!(cache.stats(), stats(1, 0, 1));

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let err = cache.get::<String>(&ctx, "p1").await.unwrap_err();
    assert!(matches!(err, CacheError::Expired(_)), "got {err}");
    assert!(err.to_string().contains("expired"));
    assert_eq!(cache.stats(), stats(1, 1, 1));
}

#[tokio::test]
async fn test_missing_key_is_a_miss() {
    let (cache, _temp_dir) = create_test_cache().await;

    let err = cache.get::<String>(&Context::new(), "missing").await.unwrap_err();

    assert!(matches!(err, CacheError::Miss(_)));
    assert!(err.to_string().contains("cache miss"));
    assert_eq!(cache.stats(), stats(0, 1, 0));
}

#[tokio::test]
async fn test_malformed_file_is_a_deserialize_error_not_a_miss() {
    let (cache, _temp_dir) = create_test_cache().await;
    let ctx = Context::new();
    cache.set(&ctx, "doc", &vec![1, 2, 3], TimeDelta::hours(1)).await.unwrap();

    std::fs::write(cache.path("doc"), "{\"payload\": [1, 2,").unwrap();

    let err = cache.get::<Vec<i32>>(&ctx, "doc").await.unwrap_err();
    assert!(matches!(err, CacheError::Deserialize { .. }), "got {err}");
    assert!(err.is_fallthrough());
    assert_eq!(cache.stats(), stats(0, 0, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_set_get_loses_no_counts() {
    let (cache, _temp_dir) = create_test_cache().await;
    let cache = Arc::new(cache);
    let ctx = Context::new();

    let mut handles = Vec::new();
    for task in 0..10 {
        let cache = Arc::clone(&cache);
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..20 {
                cache
                    .set(&ctx, "shared", &(task, round), TimeDelta::minutes(1))
                    .await
                    .expect("set should succeed");
                let (_, seen_round): (i32, i32) =
                    cache.get(&ctx, "shared").await.expect("entry is never partial");
                assert!((0..20).contains(&seen_round));
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    let stats = cache.stats();
    assert_eq!(stats.hits + stats.misses, 200);
    assert_eq!(stats.size, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_to_distinct_keys_count_each_once() {
    let (cache, _temp_dir) = create_test_cache().await;
    let cache = Arc::new(cache);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let ctx = Context::new();
                cache.set(&ctx, &format!("key-{i}"), &i, TimeDelta::zero()).await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(cache.stats().size, 16);
}

#[tokio::test]
async fn test_keys_with_separators_stay_in_cache_directory() {
    let (cache, temp_dir) = create_test_cache().await;
    let ctx = Context::new();

    for key in ["../escape", "a/b/c", "/etc/passwd", "..", "C:\\windows"] {
        cache.set(&ctx, key, key, TimeDelta::zero()).await.unwrap();
        let path = entry_path(temp_dir.path(), key);
        assert_eq!(path, entry_path(temp_dir.path(), key), "path is deterministic");
        assert_eq!(path.parent(), Some(temp_dir.path()));
        assert_eq!(cache.get::<String>(&ctx, key).await.unwrap(), key);
    }
    assert!(!temp_dir.path().join("..").join("escape.json").exists());
    assert_eq!(cache.stats().size, 5);
}

#[tokio::test]
async fn test_clear_keeps_lifetime_counters() {
    let (cache, _temp_dir) = create_test_cache().await;
    let ctx = Context::new();
    cache.set(&ctx, "a", &1, TimeDelta::zero()).await.unwrap();
    cache.set(&ctx, "b", &2, TimeDelta::zero()).await.unwrap();
    let _: i32 = cache.get(&ctx, "a").await.unwrap();
    let _ = cache.get::<i32>(&ctx, "c").await;

    cache.clear().await.unwrap();

    assert_eq!(cache.stats(), stats(1, 1, 0));
    let err = cache.get::<i32>(&ctx, "a").await.unwrap_err();
    assert!(matches!(err, CacheError::Miss(_)));
    assert_eq!(cache.stats(), stats(1, 2, 0));
}

#[tokio::test]
async fn test_delete_of_absent_key_is_ok() {
    let (cache, _temp_dir) = create_test_cache().await;
    cache.delete("nothing-here").await.expect("absent key is not an error");
    assert_eq!(cache.stats(), CacheStats::default());
}

#[tokio::test]
async fn test_cancelled_context_fails_without_io() {
    let (cache, temp_dir) = create_test_cache().await;
    let ctx = Context::new();
    ctx.cancel();

    let err = cache.set(&ctx, "k", "v", TimeDelta::zero()).await.unwrap_err();
    assert!(matches!(err, CacheError::Cancelled(CancelReason::Cancelled)));
    let err = cache.get::<String>(&ctx, "k").await.unwrap_err();
    assert!(matches!(err, CacheError::Cancelled(CancelReason::Cancelled)));

    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    assert_eq!(cache.stats(), CacheStats::default());
}

#[tokio::test]
async fn test_expired_deadline_reports_deadline_exceeded() {
    let (cache, _temp_dir) = create_test_cache().await;
    let ctx = Context::with_timeout(Duration::ZERO);

    let err = cache.get::<String>(&ctx, "k").await.unwrap_err();
    assert!(matches!(err, CacheError::Cancelled(CancelReason::DeadlineExceeded)));
}

#[test]
fn test_is_expired_boundaries() {
    let written = Utc::now();
    let forever = CacheEntry {
        key: "k".to_string(),
        payload: (),
        written_at: written,
        ttl: TimeDelta::zero(),
    };
    assert!(!is_expired(&forever, written + TimeDelta::days(36_500)));
    assert!(!Cache::is_expired(&forever, written + TimeDelta::days(36_500)));

    let short = CacheEntry {
        ttl: TimeDelta::seconds(2),
        ..forever
    };
    assert!(!Cache::is_expired(&short, written + TimeDelta::milliseconds(1999)));
    assert!(Cache::is_expired(&short, written + TimeDelta::milliseconds(2001)));
}

#[tokio::test]
async fn test_reopen_restores_size_from_disk() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = Context::new();
    {
        let cache = Cache::open(temp_dir.path()).await.unwrap();
        for key in ["one", "two", "three"] {
            cache.set(&ctx, key, key, TimeDelta::zero()).await.unwrap();
        }
    }

    let cache = Cache::open(temp_dir.path()).await.unwrap();
    assert_eq!(cache.stats(), stats(0, 0, 3));
    assert_eq!(cache.get::<String>(&ctx, "two").await.unwrap(), "two");
}
