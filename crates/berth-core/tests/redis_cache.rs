use std::time::{Duration, SystemTime, UNIX_EPOCH};

use berth_core::cache::{KvCache, RedisKvCache};

/// These tests need a live server; they pass vacuously when
/// `BERTH_TEST_REDIS_URL` is unset.
fn cache() -> Option<RedisKvCache> {
    let url = std::env::var("BERTH_TEST_REDIS_URL").ok()?;
    Some(RedisKvCache::open(&url).expect("valid redis url"))
}

fn unique_prefix(test_name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    format!("berth-test:{test_name}:{nanos}:")
}

#[tokio::test]
async fn compare_and_save_rejects_stale_revisions_across_handles() {
    let Some(first) = cache() else {
        return;
    };
    let Some(second) = cache() else {
        return;
    };
    let key = format!("{}cell", unique_prefix("cas"));

    assert!(first.compare_and_save(&key, None, "a".into(), None).await.unwrap());
    assert!(!second.compare_and_save(&key, None, "b".into(), None).await.unwrap());

    let seen = second.fetch(&key).await.unwrap().unwrap();
    assert_eq!(seen.value, "a");
    first.save(&key, "c".into(), None).await.unwrap();
    assert!(!second
        .compare_and_save(&key, Some(seen.revision), "d".into(), None)
        .await
        .unwrap());

    let current = first.fetch(&key).await.unwrap().unwrap();
    assert_eq!(current.value, "c");
    assert!(second
        .compare_and_save(&key, Some(current.revision), "e".into(), None)
        .await
        .unwrap());
    assert_eq!(first.fetch(&key).await.unwrap().unwrap().value, "e");

    first.delete(&key).await.unwrap();
    assert!(!first.contains(&key).await.unwrap());
}

#[tokio::test]
async fn entries_expire_and_scan_matches_the_prefix_only() {
    let Some(cache) = cache() else {
        return;
    };
    let prefix = unique_prefix("scan");
    let short = format!("{prefix}short");
    let kept = format!("{prefix}kept");
    let other = format!("{}other", unique_prefix("scan-other"));

    cache
        .save(&short, "x".into(), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    cache.save(&kept, "y".into(), None).await.unwrap();
    cache.save(&other, "z".into(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!cache.contains(&short).await.unwrap());
    assert_eq!(cache.scan(&prefix).await.unwrap(), vec![kept.clone()]);

    cache.delete(&kept).await.unwrap();
    cache.delete(&other).await.unwrap();
}
