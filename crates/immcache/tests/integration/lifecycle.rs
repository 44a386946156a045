use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use immcache::{CacheEntry, DiskCache, DiskCacheConfig, RecencyIndex, StreamSource};
use immcache_test as test;
use tokio::io::AsyncReadExt;

use crate::{TestLoader, read_all, setup_cache, stored_files, temp_files, wait_until};

#[tokio::test]
async fn test_purge_and_close() {
    let (cache, cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");

    read_all(cache.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();
    let base = cache.base_path().unwrap();
    assert!(base.is_dir());

    cache.purge_and_close().await.unwrap();
    assert!(!base.exists());
    assert_eq!(cache.base_path(), None);
    assert!(!cache.contains("k"));

    // a closed cache is a pass-through, and never recreates its directory
    loader.set_content("tata");
    for _ in 0..2 {
        let stream = cache.get_or_load("k", &loader).await.unwrap();
        let (content, source) = read_all(stream).await.unwrap();
        assert_eq!(content, b"tata");
        assert_eq!(source, StreamSource::Loader);
    }
    assert!(!base.exists());
    assert_eq!(std::fs::read_dir(cache_dir.path()).unwrap().count(), 0);
    assert_eq!(loader.calls(), 3);

    cache.purge_and_close().await.unwrap();
}

#[tokio::test]
async fn test_tee_finishing_after_purge() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");

    let mut stream = cache.get_or_load("k", &loader).await.unwrap();
    assert_eq!(stream.source(), StreamSource::Tee);
    let base = cache.base_path().unwrap();
    cache.purge_and_close().await.unwrap();

    let mut content = Vec::new();
    stream.read_to_end(&mut content).await.unwrap();
    assert_eq!(content, b"toto");
    stream.close().await.unwrap();

    assert!(!base.exists());
    assert!(!cache.contains("k"));
    assert_eq!(cache.tracked_size(), 0);
}

#[tokio::test]
async fn test_initialization_failure() {
    test::setup();
    let cache_dir = test::tempdir();
    let file = cache_dir.path().join("file");
    std::fs::write(&file, b"not a directory").unwrap();

    let cache = DiskCache::new(DiskCacheConfig {
        base_path: Some(file.join("cache")),
        ..Default::default()
    });
    let loader = TestLoader::new("toto");

    for _ in 0..2 {
        let stream = cache.get_or_load("k", &loader).await.unwrap();
        let (content, source) = read_all(stream).await.unwrap();
        assert_eq!(content, b"toto");
        assert_eq!(source, StreamSource::Loader);
    }
    assert_eq!(cache.base_path(), None);
    assert_eq!(loader.calls(), 2);

    // errors of the loader are still passed through
    let failing = immcache::FnLoader(|_: String| async {
        Err::<immcache::Loaded, _>(anyhow::anyhow!("load error"))
    });
    let err = cache.get_or_load("k", &failing).await.unwrap_err();
    assert!(err.is_loader_error());
}

#[tokio::test]
async fn test_generated_base_directory() {
    let parent = test::tempdir();
    let (cache, _cache_dir) = setup_cache(|config| {
        config.base_path = Some(parent.path().to_owned());
        config.base_path_prefix = Some("immcache-test-".into());
    });
    let loader = TestLoader::new("toto");

    read_all(cache.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();
    let base = cache.base_path().unwrap();
    assert_eq!(base.parent(), Some(parent.path()));
    let name = base.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("immcache-test-"));

    cache.purge_and_close().await.unwrap();
    assert!(!base.exists());
    assert!(parent.path().is_dir());
}

#[tokio::test]
async fn test_stale_temporary_files_are_removed() {
    let (cache, cache_dir) = setup_cache(|_| {});
    let base = cache_dir.path().join("cache");
    std::fs::create_dir(&base).unwrap();
    std::fs::write(base.join(".tmpAbCdEf"), b"half written").unwrap();

    let loader = TestLoader::new("toto");
    read_all(cache.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();

    assert!(temp_files(&base).is_empty());
    assert_eq!(stored_files(&base).len(), 1);
}

#[tokio::test]
async fn test_dropped_tee() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");

    let mut stream = cache.get_or_load("k", &loader).await.unwrap();
    assert_eq!(stream.source(), StreamSource::Tee);
    let mut head = [0; 2];
    stream.read_exact(&mut head).await.unwrap();
    drop(stream);

    let base = cache.base_path().unwrap();
    assert!(temp_files(&base).is_empty());
    assert!(!cache.contains("k"));

    // the abandoned load is not in flight anymore
    let stream = cache.get_or_load("k", &loader).await.unwrap();
    assert_eq!(read_all(stream).await.unwrap().1, StreamSource::Tee);
    assert!(cache.contains("k"));
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_clones_share_state() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");

    let clone = cache.clone();
    read_all(clone.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();
    let stream = cache.get_or_load("k", &loader).await.unwrap();
    assert_eq!(read_all(stream).await.unwrap().1, StreamSource::Disk);

    drop(cache);
    clone.purge_and_close().await.unwrap();
}

/// Evicts entries in insertion order, ignoring accesses.
#[derive(Debug, Default)]
struct Fifo {
    order: VecDeque<String>,
    entries: HashMap<String, CacheEntry>,
}

impl RecencyIndex<String, CacheEntry> for Fifo {
    fn get(&mut self, key: &String) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn set(&mut self, key: String, value: CacheEntry) -> Option<CacheEntry> {
        let replaced = self.entries.insert(key.clone(), value);
        if replaced.is_none() {
            self.order.push_back(key);
        }
        replaced
    }

    fn remove_least_valuable(&mut self) -> Option<(String, CacheEntry)> {
        let key = self.order.pop_front()?;
        let value = self.entries.remove(&key)?;
        Some((key, value))
    }
}

#[tokio::test]
async fn test_custom_index() {
    test::setup();
    let cache_dir = test::tempdir();
    let cache = DiskCache::with_index(
        Fifo::default(),
        DiskCacheConfig {
            base_path: Some(cache_dir.path().to_owned()),
            max_size: 40,
            eviction_period_min: Duration::ZERO,
            ..Default::default()
        },
    );

    let keys = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
    for key in keys {
        let loader = TestLoader::new(key.repeat(4));
        read_all(cache.get_or_load(key, &loader).await.unwrap())
            .await
            .unwrap();
    }
    assert_eq!(cache.tracked_size(), 40);

    // accessing "a" does not save it with this policy
    assert!(cache.contains("a"));
    let loader = TestLoader::new("kkkk");
    read_all(cache.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();

    assert!(wait_until(|| cache.tracked_size() <= 40).await);
    assert!(!cache.contains("a"));
    assert!(cache.contains("b"));
    assert!(cache.contains("k"));
}
