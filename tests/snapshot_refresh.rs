//! Integration test: storage node -> reader node snapshot refresh.
//!
//! Validates that:
//! - Parts handed to a storage node are verified, staged and merged in order
//! - A reader node serves the storage node's data from a fetched snapshot
//! - A stale snapshot is replaced in the background and readers see new data
//! - An unchanged storage node answers "not modified" and nothing is copied
//! - Reads keep succeeding while snapshots rotate underneath them

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use planb::descriptor::FileDescriptor;
use planb::transfer::now_ms;
use planb::{
    Db, FileDb, FileDbFactory, FileTransferClient, LocalFileTransferClient, LocalNode,
    MergeProcessor, PlanBConfig, PlanBError, ShardManager, SnapshotRequest, StagingFileStore,
    StatePaths,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Counts fetches and "not modified" answers on the way through.
struct CountingClient {
    inner: LocalFileTransferClient,
    fetches: AtomicUsize,
    not_modified: AtomicUsize,
}

impl FileTransferClient for CountingClient {
    fn fetch_snapshot(&self, request: &SnapshotRequest, dest_dir: &Path) -> planb::Result<SystemTime> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.fetch_snapshot(request, dest_dir);
        if matches!(result, Err(PlanBError::SnapshotNotModified(_))) {
            self.not_modified.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    fn store_part_remotely(&self, node: &str, descriptor: &FileDescriptor, path: &Path) -> planb::Result<()> {
        self.inner.store_part_remotely(node, descriptor, path)
    }
}

struct Cluster {
    _dirs: Vec<TempDir>,
    parts: TempDir,
    storage: Arc<ShardManager>,
    merger: MergeProcessor,
    client: Arc<CountingClient>,
    reader: ShardManager,
    next_part: AtomicUsize,
}

impl Cluster {
    fn new(keep_ms: u64) -> Self {
        let store_dir = TempDir::new().unwrap();
        let reader_dir = TempDir::new().unwrap();

        let store_config = PlanBConfig {
            path: store_dir.path().to_path_buf(),
            this_node: "store".to_string(),
            nodes: vec!["store".to_string()],
            ..PlanBConfig::default()
        }
        .fixed();
        let store_paths = StatePaths::new(store_dir.path());
        let storage = Arc::new(ShardManager::new(
            Arc::clone(&store_config),
            store_paths.clone(),
            None,
            Arc::new(FileDbFactory),
        ));
        let staging = Arc::new(StagingFileStore::open(&store_paths.staging_dir()).unwrap());
        let merger = MergeProcessor::new(store_config, Arc::clone(&staging), Arc::clone(&storage));

        let client = Arc::new(CountingClient {
            inner: LocalFileTransferClient::new(vec![LocalNode {
                name: "store".to_string(),
                manager: Arc::clone(&storage),
                staging,
            }]),
            fetches: AtomicUsize::new(0),
            not_modified: AtomicUsize::new(0),
        });

        let reader_config = PlanBConfig {
            path: reader_dir.path().to_path_buf(),
            this_node: "reader".to_string(),
            nodes: vec!["store".to_string()],
            min_time_to_keep_snapshots_ms: keep_ms,
            snapshot_retry_fetch_interval_ms: keep_ms,
            ..PlanBConfig::default()
        };
        let reader = ShardManager::new(
            reader_config.fixed(),
            StatePaths::new(reader_dir.path()),
            Some(Arc::clone(&client) as Arc<dyn FileTransferClient>),
            Arc::new(FileDbFactory),
        );

        Self {
            _dirs: vec![store_dir, reader_dir],
            parts: TempDir::new().unwrap(),
            storage,
            merger,
            client,
            reader,
            next_part: AtomicUsize::new(0),
        }
    }

    /// Build a one-map part, push it to the storage node and merge it.
    fn publish(&self, map: &str, key: &str, value: &str) {
        let n = self.next_part.fetch_add(1, Ordering::SeqCst);
        let part: PathBuf = self.parts.path().join(format!("part-{}", n));
        let db = FileDb::open(&part.join(map), false).unwrap();
        db.insert(key.as_bytes(), value.as_bytes(), n as i64).unwrap();
        db.close().unwrap();

        let descriptor = FileDescriptor::for_path(now_ms(), 7, &part).unwrap();
        self.client.store_part_remotely("store", &descriptor, &part).unwrap();
        assert_eq!(self.merger.merge_available().unwrap(), 1);
    }

    fn read(&self, map: &str, key: &str) -> Option<String> {
        self.reader
            .get(map, key.as_bytes(), i64::MAX)
            .unwrap()
            .map(|v| String::from_utf8(v).unwrap())
    }

    /// Read until `expected` shows up, failing after a few seconds.
    fn read_until(&self, map: &str, key: &str, expected: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.read(map, key).as_deref() == Some(expected) {
                return;
            }
            assert!(Instant::now() < deadline, "reader never saw {}={}", key, expected);
            thread::sleep(Duration::from_millis(10));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests: Snapshot lifecycle
// ---------------------------------------------------------------------------

#[test]
fn reader_serves_published_data() {
    let cluster = Cluster::new(60_000);
    cluster.publish("hosts", "web-1", "10.0.0.1");

    assert_eq!(cluster.read("hosts", "web-1").as_deref(), Some("10.0.0.1"));
    assert_eq!(cluster.read("hosts", "web-2"), None);
    assert_eq!(cluster.client.fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn stale_snapshot_is_refreshed() {
    let cluster = Cluster::new(300);
    cluster.publish("hosts", "web-1", "10.0.0.1");
    assert_eq!(cluster.read("hosts", "web-1").as_deref(), Some("10.0.0.1"));

    cluster.publish("hosts", "web-1", "10.0.0.2");
    // Still inside the keep window: the old snapshot is served.
    assert_eq!(cluster.read("hosts", "web-1").as_deref(), Some("10.0.0.1"));

    thread::sleep(Duration::from_millis(350));
    cluster.read_until("hosts", "web-1", "10.0.0.2");
    assert!(cluster.client.fetches.load(Ordering::SeqCst) >= 2);
}

#[test]
fn unchanged_storage_answers_not_modified() {
    let cluster = Cluster::new(30);
    cluster.publish("hosts", "web-1", "10.0.0.1");
    assert_eq!(cluster.read("hosts", "web-1").as_deref(), Some("10.0.0.1"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while cluster.client.not_modified.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "no rotation attempt was made");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cluster.read("hosts", "web-1").as_deref(), Some("10.0.0.1"));
    }
}

#[test]
fn maps_are_independent() {
    let cluster = Cluster::new(60_000);
    cluster.publish("hosts", "web-1", "10.0.0.1");
    cluster.publish("users", "alice", "admin");

    assert_eq!(cluster.read("users", "alice").as_deref(), Some("admin"));
    assert_eq!(cluster.read("hosts", "alice"), None);
    assert_eq!(cluster.reader.shard_names(), vec!["hosts".to_string(), "users".to_string()]);
}

// ---------------------------------------------------------------------------
// Tests: Concurrency
// ---------------------------------------------------------------------------

#[test]
fn reads_never_fail_while_snapshots_rotate() {
    let cluster = Arc::new(Cluster::new(10));
    cluster.publish("hosts", "counter", "0");
    assert!(cluster.read("hosts", "counter").is_some());

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cluster = Arc::clone(&cluster);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0usize;
                while !done.load(Ordering::SeqCst) {
                    let value = cluster.reader.get("hosts", b"counter", i64::MAX).unwrap();
                    assert!(value.is_some());
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for i in 1..=10 {
        cluster.publish("hosts", "counter", &i.to_string());
        thread::sleep(Duration::from_millis(15));
    }
    done.store(true, Ordering::SeqCst);

    let total: usize = readers.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total > 0);
    cluster.read_until("hosts", "counter", "10");
}

#[test]
fn deleting_map_on_reader_drops_snapshot() {
    let cluster = Cluster::new(60_000);
    cluster.publish("hosts", "web-1", "10.0.0.1");
    assert!(cluster.read("hosts", "web-1").is_some());

    assert!(cluster.reader.delete("hosts").unwrap());
    assert!(cluster.reader.shard_names().is_empty());

    // A later read starts over with a fresh fetch.
    assert_eq!(cluster.read("hosts", "web-1").as_deref(), Some("10.0.0.1"));
    assert_eq!(cluster.client.fetches.load(Ordering::SeqCst), 2);
    assert!(cluster.storage.get("hosts", b"web-1", i64::MAX).unwrap().is_some());
}
