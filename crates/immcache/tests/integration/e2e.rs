use immcache::{CacheError, FnLoader, Loaded, StreamSource};
use tokio::io::AsyncReadExt;

use crate::{FailReader, TestLoader, read_all, setup_cache};

#[tokio::test]
async fn test_load_then_hit() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");

    let stream = cache.get_or_load("k", &loader).await.unwrap();
    let (content, source) = read_all(stream).await.unwrap();
    assert_eq!(content, b"toto");
    assert_eq!(source, StreamSource::Tee);

    // the cached value wins over whatever the loader would return now
    loader.set_content("tata");
    for _ in 0..3 {
        let stream = cache.get_or_load("k", &loader).await.unwrap();
        let (content, source) = read_all(stream).await.unwrap();
        assert_eq!(content, b"toto");
        assert_eq!(source, StreamSource::Disk);
    }

    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.tracked_size(), 4);
}

#[tokio::test]
async fn test_exact_length_read_publishes() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("toto");

    let mut stream = cache.get_or_load("k", &loader).await.unwrap();
    assert_eq!(stream.source(), StreamSource::Tee);
    let mut content = [0; 4];
    stream.read_exact(&mut content).await.unwrap();
    assert_eq!(&content, b"toto");
    stream.close().await.unwrap();
    assert!(cache.contains("k"));

    let stream = cache.get_or_load("k", &loader).await.unwrap();
    let (content, source) = read_all(stream).await.unwrap();
    assert_eq!(content, b"toto");
    assert_eq!(source, StreamSource::Disk);
    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_distinct_keys() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let toto = TestLoader::new("toto");
    let tata = TestLoader::new("tata");

    read_all(cache.get_or_load("a", &toto).await.unwrap())
        .await
        .unwrap();
    read_all(cache.get_or_load("b", &tata).await.unwrap())
        .await
        .unwrap();

    let (content, _) = read_all(cache.get_or_load("a", &tata).await.unwrap())
        .await
        .unwrap();
    assert_eq!(content, b"toto");
    let (content, _) = read_all(cache.get_or_load("b", &toto).await.unwrap())
        .await
        .unwrap();
    assert_eq!(content, b"tata");
}

#[tokio::test]
async fn test_key_failures() {
    let (cache, _cache_dir) = setup_cache(|_| {});

    // the loader stream fails after a few bytes
    let failing = FnLoader(|_: String| async {
        let reader = AsyncReadExt::chain(&b"toto"[..], FailReader);
        Ok(Loaded::new(Some(16), reader))
    });
    let mut stream = cache.get_or_load("keyfailure", &failing).await.unwrap();
    assert_eq!(stream.source(), StreamSource::Tee);

    let mut head = [0; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(&head, b"toto");
    let err = stream.read_to_end(&mut Vec::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "test fail");
    stream.close().await.unwrap();
    assert!(!cache.contains("keyfailure"));

    // the loader fails right away
    let erroring = FnLoader(|_: String| async { Err::<Loaded, _>(anyhow::anyhow!("test fail")) });
    let err = cache
        .get_or_load("keyfailure", &erroring)
        .await
        .unwrap_err();
    assert!(err.is_loader_error());
    assert_eq!(err.to_string(), "test fail");

    // a stream with a wrong length that is closed without being read
    let wrong_length = FnLoader(|_: String| async {
        Ok(Loaded::new(Some(16), &b"toto"[..]))
    });
    let stream = cache
        .get_or_load("keyfailure", &wrong_length)
        .await
        .unwrap();
    assert_eq!(stream.source(), StreamSource::Tee);
    stream.close().await.unwrap();
    assert!(!cache.contains("keyfailure"));

    // a stream with a wrong length that is read to its end
    let stream = cache
        .get_or_load("keyfailure", &wrong_length)
        .await
        .unwrap();
    let err = read_all(stream).await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::SizeMismatch {
            expected: 16,
            actual: 4
        }
    ));
    assert!(!cache.contains("keyfailure"));

    // and finally, a good one
    let good = FnLoader(|_: String| async { Ok(Loaded::from_bytes("toto")) });
    let stream = cache.get_or_load("keyfailure", &good).await.unwrap();
    assert_eq!(stream.source(), StreamSource::Tee);
    let (content, _) = read_all(stream).await.unwrap();
    assert_eq!(content, b"toto");
    assert!(cache.contains("keyfailure"));

    let stream = cache.get_or_load("keyfailure", &wrong_length).await.unwrap();
    assert_eq!(stream.source(), StreamSource::Disk);
    let (content, _) = read_all(stream).await.unwrap();
    assert_eq!(content, b"toto");

    assert_eq!(cache.tracked_size(), 4);
}

#[tokio::test]
async fn test_oversized_stream() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = FnLoader(|_: String| async { Ok(Loaded::new(Some(2), &b"toto"[..])) });

    let mut stream = cache.get_or_load("k", &loader).await.unwrap();
    let mut head = [0; 3];
    stream.read_exact(&mut head).await.unwrap();

    // more bytes than declared is a mismatch, even before the end of the stream
    let err = stream.close().await.unwrap_err();
    assert!(matches!(
        err,
        CacheError::SizeMismatch {
            expected: 2,
            actual: 3
        }
    ));
    assert!(!cache.contains("k"));
}

#[tokio::test]
async fn test_unknown_size() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = FnLoader(|_: String| async { Ok(Loaded::new(None, &b"toto"[..])) });

    for _ in 0..2 {
        let stream = cache.get_or_load("k", &loader).await.unwrap();
        let (content, source) = read_all(stream).await.unwrap();
        assert_eq!(content, b"toto");
        assert_eq!(source, StreamSource::Loader);
    }
    assert!(!cache.contains("k"));
    assert_eq!(cache.tracked_size(), 0);
}

#[tokio::test]
async fn test_admission_skip() {
    let (cache, _cache_dir) = setup_cache(|config| config.max_size = 100);

    let large = TestLoader::new(vec![b'x'; 11]);
    let stream = cache.get_or_load("large", &large).await.unwrap();
    let (content, source) = read_all(stream).await.unwrap();
    assert_eq!(content, vec![b'x'; 11]);
    assert_eq!(source, StreamSource::Loader);
    assert!(!cache.contains("large"));

    // exactly a tenth of the budget is still admitted
    let small = TestLoader::new(vec![b'x'; 10]);
    let stream = cache.get_or_load("small", &small).await.unwrap();
    assert_eq!(read_all(stream).await.unwrap().1, StreamSource::Tee);
    assert!(cache.contains("small"));
    assert_eq!(cache.tracked_size(), 10);
}

#[tokio::test]
async fn test_empty_value() {
    let (cache, _cache_dir) = setup_cache(|_| {});
    let loader = TestLoader::new("");

    for source in [StreamSource::Tee, StreamSource::Disk] {
        let stream = cache.get_or_load("empty", &loader).await.unwrap();
        assert_eq!(read_all(stream).await.unwrap(), (vec![], source));
    }
    assert_eq!(loader.calls(), 1);
}
