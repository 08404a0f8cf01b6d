use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::caching::{CacheEntry, CacheError};
use crate::config::Config;
use crate::download::TransformStage;

use super::*;

use thumbcache_test as tctest;

#[derive(Debug, Clone, PartialEq)]
struct TestImage {
    bytes: Bytes,
}

/// Treats the raw bytes as the decoded image, rejecting anything that starts
/// with `garbage`, or everything while `reject_all` is set.
#[derive(Clone, Default)]
struct TestDecoder {
    reject_all: Arc<AtomicBool>,
}

impl AssetDecoder for TestDecoder {
    type Asset = TestImage;

    fn decode(&self, bytes: &[u8]) -> CacheEntry<TestImage> {
        if self.reject_all.load(Ordering::Relaxed) || bytes.starts_with(b"garbage") {
            return Err(CacheError::Decode("not an image".into()));
        }

        Ok(TestImage {
            bytes: Bytes::copy_from_slice(bytes),
        })
    }

    fn weight(asset: &TestImage) -> u64 {
        asset.bytes.len() as u64
    }
}

/// An in-memory display slot recording everything delivered to it.
#[derive(Default)]
struct TestTarget {
    tag: Mutex<Option<Arc<str>>>,
    displayed: Mutex<Vec<TestImage>>,
    placeholders: Mutex<Vec<PlaceholderRef>>,
}

impl TestTarget {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn last_displayed(&self) -> Option<Vec<u8>> {
        self.displayed
            .lock()
            .unwrap()
            .last()
            .map(|image| image.bytes.to_vec())
    }

    fn displayed_count(&self) -> usize {
        self.displayed.lock().unwrap().len()
    }

    fn placeholders(&self) -> Vec<PlaceholderRef> {
        self.placeholders.lock().unwrap().clone()
    }
}

impl DisplayTarget for TestTarget {
    type Asset = TestImage;

    fn current_tag(&self) -> Option<Arc<str>> {
        self.tag.lock().unwrap().clone()
    }

    fn set_current_tag(&self, tag: Arc<str>) {
        *self.tag.lock().unwrap() = Some(tag);
    }

    fn display(&self, asset: TestImage) {
        self.displayed.lock().unwrap().push(asset);
    }

    fn display_placeholder(&self, placeholder: PlaceholderRef) {
        self.placeholders.lock().unwrap().push(placeholder);
    }
}

fn memory_only_config() -> Config {
    Config {
        worker_threads: 4,
        ..Config::default()
    }
}

fn disk_config(cache_dir: &Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..memory_only_config()
    }
}

#[tokio::test]
async fn test_load_populates_and_hits_memory() {
    tctest::setup();

    let server = tctest::ImageServer::new();
    server.insert("one.png", &b"ONE"[..]);

    let loader = ImageLoader::new(&memory_only_config(), TestDecoder::default()).unwrap();
    let url = server.image_url("one.png");

    let target = TestTarget::new();
    loader.request(target.clone(), url.as_str(), Some(PlaceholderRef(7)));
    loader.wait_idle().await;

    assert_eq!(target.last_displayed().unwrap(), b"ONE");
    assert_eq!(target.placeholders(), vec![PlaceholderRef(7)]);

    // a second request is served synchronously from memory, with no
    // placeholder flicker and no further network access
    let second = TestTarget::new();
    loader.request(second.clone(), url.as_str(), Some(PlaceholderRef(7)));

    assert_eq!(second.last_displayed().unwrap(), b"ONE");
    assert_eq!(second.placeholders(), vec![]);
    assert_eq!(loader.in_flight(), 0);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_deduplicated() {
    tctest::setup();

    let server = tctest::ImageServer::new();
    server.insert("img.png", &b"IMG"[..]);

    let loader = ImageLoader::new(&memory_only_config(), TestDecoder::default()).unwrap();
    let url = server.slow_url("500ms", "img.png");

    let targets: Vec<_> = (0..8).map(|_| TestTarget::new()).collect();
    for target in &targets {
        loader.request(target.clone(), url.as_str(), None);
    }

    // all eight requests share a single ticket
    assert_eq!(loader.in_flight(), 1);
    loader.wait_idle().await;

    for target in &targets {
        assert_eq!(target.last_displayed().unwrap(), b"IMG");
    }
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_stale_result_dropped() {
    tctest::setup();

    let server = tctest::ImageServer::new();
    server.insert("a.png", &b"AAA"[..]);
    server.insert("b.png", &b"BBB"[..]);

    let loader = ImageLoader::new(&memory_only_config(), TestDecoder::default()).unwrap();

    // the target is rebound to `b` while the fetch for `a` is still running
    let target = TestTarget::new();
    loader.request(target.clone(), server.slow_url("500ms", "a.png").as_str(), None);
    loader.request(target.clone(), server.image_url("b.png").as_str(), None);
    loader.wait_idle().await;

    assert_eq!(target.last_displayed().unwrap(), b"BBB");
    let displayed = target.displayed.lock().unwrap();
    assert!(displayed.iter().all(|image| image.bytes.as_ref() != b"AAA"));
}

#[tokio::test]
async fn test_memory_hit_rebinds_target() {
    tctest::setup();

    let server = tctest::ImageServer::new();
    server.insert("a.png", &b"AAA"[..]);
    server.insert("b.png", &b"BBB"[..]);

    let loader = ImageLoader::new(&memory_only_config(), TestDecoder::default()).unwrap();

    // warm the memory cache for `b`
    let warm = TestTarget::new();
    loader.request(warm.clone(), server.image_url("b.png").as_str(), None);
    loader.wait_idle().await;

    // a pending load for `a` must not overwrite the later cache hit for `b`
    let target = TestTarget::new();
    loader.request(target.clone(), server.slow_url("500ms", "a.png").as_str(), None);
    loader.request(target.clone(), server.image_url("b.png").as_str(), None);
    assert_eq!(target.last_displayed().unwrap(), b"BBB");

    loader.wait_idle().await;
    assert_eq!(target.last_displayed().unwrap(), b"BBB");
    assert_eq!(target.displayed_count(), 1);
}

#[tokio::test]
async fn test_failed_load_not_cached() {
    tctest::setup();

    let server = tctest::ImageServer::new();

    let loader = ImageLoader::new(&memory_only_config(), TestDecoder::default()).unwrap();
    let url = server.image_url("missing.png");

    let target = TestTarget::new();
    loader.request(target.clone(), url.as_str(), Some(PlaceholderRef(1)));
    loader.wait_idle().await;

    assert_eq!(target.displayed_count(), 0);
    assert_eq!(target.placeholders(), vec![PlaceholderRef(1)]);

    // failures populate no cache, a later request fetches again
    let retry = TestTarget::new();
    loader.request(retry.clone(), url.as_str(), None);
    loader.wait_idle().await;

    assert_eq!(retry.displayed_count(), 0);
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_corrupt_disk_record_evicted() {
    tctest::setup();

    let server = tctest::ImageServer::new();
    server.insert("x.png", &b"XDATA"[..]);

    let cache_dir = tctest::tempdir();
    let config = Config {
        // keep nothing in memory so every request exercises the disk layer
        memory_budget_bytes: 0,
        ..disk_config(cache_dir.path())
    };

    let decoder = TestDecoder::default();
    let reject_all = decoder.reject_all.clone();
    let loader = ImageLoader::new(&config, decoder).unwrap();
    let url = server.image_url("x.png");

    let first = TestTarget::new();
    loader.request(first.clone(), url.as_str(), None);
    loader.wait_idle().await;
    assert_eq!(first.last_displayed().unwrap(), b"XDATA");
    assert_eq!(server.accesses(), 1);

    // the next request hits the persistent record, which the codec now
    // rejects: the record is dropped and the request fails without falling
    // back to the network
    reject_all.store(true, Ordering::Relaxed);
    let second = TestTarget::new();
    loader.request(second.clone(), url.as_str(), None);
    loader.wait_idle().await;
    assert_eq!(second.displayed_count(), 0);
    assert_eq!(server.accesses(), 0);

    // with the record gone, a later request downloads fresh bytes
    reject_all.store(false, Ordering::Relaxed);
    let third = TestTarget::new();
    loader.request(third.clone(), url.as_str(), None);
    loader.wait_idle().await;
    assert_eq!(third.last_displayed().unwrap(), b"XDATA");
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_disk_cache_survives_restart() {
    tctest::setup();

    let server = tctest::ImageServer::new();
    server.insert("keep.png", &b"KEEP"[..]);

    let cache_dir = tctest::tempdir();
    let url = server.image_url("keep.png");

    let loader = ImageLoader::new(&disk_config(cache_dir.path()), TestDecoder::default()).unwrap();
    let target = TestTarget::new();
    loader.request(target.clone(), url.as_str(), None);
    loader.wait_idle().await;
    assert_eq!(target.last_displayed().unwrap(), b"KEEP");
    drop(loader);

    // a fresh loader with an empty memory cache is served from disk
    let loader = ImageLoader::new(&disk_config(cache_dir.path()), TestDecoder::default()).unwrap();
    let target = TestTarget::new();
    loader.request(target.clone(), url.as_str(), None);
    loader.wait_idle().await;

    assert_eq!(target.last_displayed().unwrap(), b"KEEP");
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_invalid_url_is_a_no_op() {
    tctest::setup();

    let loader = ImageLoader::new(&memory_only_config(), TestDecoder::default()).unwrap();

    let target = TestTarget::new();
    loader.request(target.clone(), "", Some(PlaceholderRef(3)));

    assert_eq!(loader.in_flight(), 0);
    assert_eq!(target.current_tag(), None);
    assert_eq!(target.displayed_count(), 0);
    assert_eq!(target.placeholders(), vec![PlaceholderRef(3)]);
}

#[tokio::test]
async fn test_transform_stages_applied_before_decode_and_store() {
    tctest::setup();

    /// Appends a copy of the input to itself.
    struct Doubler;

    impl TransformStage for Doubler {
        fn process(&self, bytes: Bytes) -> CacheEntry<Bytes> {
            let mut doubled = bytes.to_vec();
            doubled.extend_from_slice(&bytes);
            Ok(doubled.into())
        }
    }

    let server = tctest::ImageServer::new();
    server.insert("t.png", &b"AB"[..]);

    let cache_dir = tctest::tempdir();
    let url = server.image_url("t.png");

    let loader = ImageLoader::with_transforms(
        &disk_config(cache_dir.path()),
        TestDecoder::default(),
        vec![Arc::new(Doubler)],
    )
    .unwrap();

    let target = TestTarget::new();
    loader.request(target.clone(), url.as_str(), None);
    loader.wait_idle().await;
    assert_eq!(target.last_displayed().unwrap(), b"ABAB");
    drop(loader);

    // the store holds the transformed bytes: a loader without any stages
    // still serves the same asset from disk
    let loader = ImageLoader::new(&disk_config(cache_dir.path()), TestDecoder::default()).unwrap();
    let target = TestTarget::new();
    loader.request(target.clone(), url.as_str(), None);
    loader.wait_idle().await;

    assert_eq!(target.last_displayed().unwrap(), b"ABAB");
    assert_eq!(server.accesses(), 1);
}
