use immcache::{CacheError, DiskCacheConfig, StreamSource};
use tokio::io::AsyncReadExt;

use crate::{TestLoader, read_all, setup_cache, stored_files};

async fn assert_corruption_detected(corrupt: impl FnOnce(&std::path::Path)) {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");

    read_all(cache.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();
    let files = stored_files(&cache.base_path().unwrap());
    assert_eq!(files.len(), 1);
    corrupt(&files[0]);

    let stream = cache.get_or_load("k", &loader).await.unwrap();
    assert_eq!(stream.source(), StreamSource::Disk);
    let err = read_all(stream).await.unwrap_err();
    assert!(matches!(err, CacheError::Corrupted));
    assert!(!files[0].exists());

    // the next request loads the value again
    let stream = cache.get_or_load("k", &loader).await.unwrap();
    let (content, source) = read_all(stream).await.unwrap();
    assert_eq!(content, b"toto");
    assert_eq!(source, StreamSource::Tee);

    let stream = cache.get_or_load("k", &loader).await.unwrap();
    assert_eq!(read_all(stream).await.unwrap().1, StreamSource::Disk);

    assert_eq!(loader.calls(), 2);
    assert_eq!(cache.tracked_size(), 4);
}

#[tokio::test]
async fn test_flipped_byte() {
    assert_corruption_detected(|path| {
        let mut content = std::fs::read(path).unwrap();
        content[1] ^= 0x20;
        std::fs::write(path, content).unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_truncated_file() {
    assert_corruption_detected(|path| {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(2).unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_appended_bytes() {
    assert_corruption_detected(|path| {
        let mut content = std::fs::read(path).unwrap();
        content.extend_from_slice(b"tata");
        std::fs::write(path, content).unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_partial_read_is_not_verified() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");
    read_all(cache.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();

    let files = stored_files(&cache.base_path().unwrap());
    std::fs::write(&files[0], b"tata").unwrap();

    let mut stream = cache.get_or_load("k", &loader).await.unwrap();
    let mut head = [0; 2];
    stream.read_exact(&mut head).await.unwrap();
    stream.close().await.unwrap();
    assert!(files[0].exists());
}

#[tokio::test]
async fn test_exact_length_read_is_verified() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");
    read_all(cache.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();

    let files = stored_files(&cache.base_path().unwrap());
    std::fs::write(&files[0], b"tata").unwrap();

    // every stored byte is consumed, without ever reading the end of the file
    let mut stream = cache.get_or_load("k", &loader).await.unwrap();
    let mut content = [0; 4];
    stream.read_exact(&mut content).await.unwrap();
    assert_eq!(&content, b"tata");
    let err = stream.close().await.unwrap_err();
    assert!(matches!(err, CacheError::Corrupted));
    assert!(!files[0].exists());
}

#[tokio::test]
async fn test_secret_is_part_of_the_digest() {
    let cache_dir = immcache_test::tempdir();
    let config = |secret: &[u8]| DiskCacheConfig {
        base_path: Some(cache_dir.path().to_owned()),
        secret: Some(secret.to_vec()),
        ..Default::default()
    };
    let loader = TestLoader::new("toto");

    let one = immcache::DiskCache::new(config(b"one"));
    read_all(one.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();
    let other = immcache::DiskCache::new(config(b"other"));
    read_all(other.get_or_load("k", &loader).await.unwrap())
        .await
        .unwrap();

    // identical content, stored under two different addresses
    let files = stored_files(cache_dir.path());
    assert_eq!(files.len(), 2);
    for file in files {
        assert_eq!(std::fs::read(file).unwrap(), b"toto");
    }
}
