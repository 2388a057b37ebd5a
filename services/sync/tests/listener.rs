use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use camino::Utf8PathBuf;
use registry_sync::{
    reload_fn, ListenerConfig, MemoryObjectStore, MemoryQueue, ObjectLocation, ObjectStore,
    QueueListener, SyncError, Writer,
};
use store::{JsonFileStore, Records, ServerJson};
use tokio::{io::AsyncWriteExt, sync::Notify};
use tokio_util::sync::CancellationToken;

struct Fixture {
    dir: tempfile::TempDir,
    store: JsonFileStore,
    queue: Arc<MemoryQueue>,
    objects: Arc<MemoryObjectStore>,
}

/// Serialize a registry with one server into a snapshot.
async fn snapshot(dir: &tempfile::TempDir, name: &str, version: &str) -> Vec<u8> {
    let path = Utf8PathBuf::from_path_buf(dir.path().join(format!("{version}.json"))).unwrap();
    let source = JsonFileStore::open(path.clone()).await.unwrap();
    source
        .create_server(ServerJson::new(name, version), None)
        .await
        .unwrap();
    std::fs::read(&path).unwrap()
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("live/registry.json")).unwrap();
    let store = JsonFileStore::open(path).await.unwrap();
    Fixture {
        dir,
        store,
        queue: Arc::new(MemoryQueue::new()),
        objects: Arc::new(MemoryObjectStore::new()),
    }
}

impl Fixture {
    fn listener(
        &self,
    ) -> QueueListener<Arc<MemoryQueue>, Arc<MemoryObjectStore>, JsonFileStore> {
        QueueListener::new(
            self.queue.clone(),
            self.objects.clone(),
            self.store.clone(),
            self.store.path(),
        )
        .with_config(&ListenerConfig {
            max_messages: Some(10),
            wait_seconds: Some(0),
        })
    }
}

#[tokio::test]
async fn applied_snapshot_is_reloaded_and_deleted() {
    let fx = fixture().await;
    let location = ObjectLocation::new("snapshots", "registry.json");
    fx.objects.put(
        location.clone(),
        snapshot(&fx.dir, "io.example/synced", "1.0.0").await,
    );
    fx.queue.send(format!(r#"{{"location": "{location}"}}"#));

    let applied = fx.listener().poll_once().await.unwrap();
    assert_eq!(applied, 1);
    assert_eq!((fx.queue.ready(), fx.queue.in_flight()), (0, 0));

    let latest = fx.store.get_server_by_name("io.example/synced").await.unwrap();
    assert_eq!(latest.version(), "1.0.0");
}

/// Object store that stops halfway through a download until resumed.
#[derive(Debug)]
struct PausingObjectStore {
    contents: Vec<u8>,
    started: Notify,
    resume: Notify,
}

#[async_trait::async_trait]
impl ObjectStore for PausingObjectStore {
    fn name(&self) -> &'static str {
        "pausing"
    }

    async fn download(
        &self,
        _location: &ObjectLocation,
        writer: &mut Writer<'_>,
    ) -> Result<u64, SyncError> {
        let (head, tail) = self.contents.split_at(self.contents.len() / 2);
        writer.write_all(head).await.unwrap();
        writer.flush().await.unwrap();
        self.started.notify_one();
        self.resume.notified().await;
        writer.write_all(tail).await.unwrap();
        Ok(self.contents.len() as u64)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_write_during_download_does_not_corrupt_snapshot() {
    let fx = fixture().await;
    let objects = Arc::new(PausingObjectStore {
        contents: snapshot(&fx.dir, "io.example/synced", "1.0.0").await,
        started: Notify::new(),
        resume: Notify::new(),
    });
    fx.queue.send(r#"{"location": "s3://snapshots/registry.json"}"#);

    let listener = QueueListener::new(
        fx.queue.clone(),
        objects.clone(),
        fx.store.clone(),
        fx.store.path(),
    )
    .with_config(&ListenerConfig {
        max_messages: Some(1),
        wait_seconds: Some(0),
    });
    let poll = tokio::spawn(async move { listener.poll_once().await });

    objects.started.notified().await;
    fx.store
        .create_server(ServerJson::new("io.example/local", "1.0.0"), None)
        .await
        .unwrap();
    objects.resume.notify_one();

    let applied = tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("poll finishes")
        .unwrap()
        .unwrap();
    assert_eq!(applied, 1);
    assert_eq!((fx.queue.ready(), fx.queue.in_flight()), (0, 0));

    // The file parses and agrees with memory: the snapshot replaced everything.
    let reopened = JsonFileStore::open(fx.store.path().to_owned()).await.unwrap();
    for store in [&fx.store, &reopened] {
        assert_eq!(
            store.get_server_by_name("io.example/synced").await.unwrap().version(),
            "1.0.0"
        );
        assert!(!store
            .check_version_exists("io.example/local", "1.0.0")
            .await
            .unwrap());
    }

    let mut names: Vec<_> = std::fs::read_dir(fx.dir.path().join("live"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["registry.json"]);

    // Writes after the install build on the snapshot.
    fx.store
        .create_server(ServerJson::new("io.example/after", "1.0.0"), None)
        .await
        .unwrap();
    let reopened = JsonFileStore::open(fx.store.path().to_owned()).await.unwrap();
    assert!(reopened
        .check_version_exists("io.example/synced", "1.0.0")
        .await
        .unwrap());
}

#[tokio::test]
async fn https_locations_and_legacy_key_are_accepted() {
    let fx = fixture().await;
    fx.objects.put(
        ObjectLocation::new("snapshots", "dir/registry.json"),
        snapshot(&fx.dir, "io.example/legacy", "2.0.0").await,
    );
    fx.queue.send(
        r#"{"s3_uri": "https://snapshots.s3.us-east-1.amazonaws.com/dir/registry.json"}"#,
    );

    assert_eq!(fx.listener().poll_once().await.unwrap(), 1);
    assert!(fx
        .store
        .check_version_exists("io.example/legacy", "2.0.0")
        .await
        .unwrap());
}

#[tokio::test]
async fn failed_messages_stay_in_flight() {
    let fx = fixture().await;
    fx.store
        .create_server(ServerJson::new("io.example/local", "1.0.0"), None)
        .await
        .unwrap();

    fx.queue.send("not json");
    fx.queue.send(r#"{"location": "https://example.com/file.json"}"#);
    fx.queue.send(r#"{"location": "s3://snapshots/missing.json"}"#);

    assert_eq!(fx.listener().poll_once().await.unwrap(), 0);
    assert_eq!((fx.queue.ready(), fx.queue.in_flight()), (0, 3));

    // Nothing was written over the live file.
    assert!(fx
        .store
        .check_version_exists("io.example/local", "1.0.0")
        .await
        .unwrap());
    fx.store.reload().await.unwrap();
    assert!(fx
        .store
        .check_version_exists("io.example/local", "1.0.0")
        .await
        .unwrap());
}

#[tokio::test]
async fn reload_failure_leaves_message() {
    let fx = fixture().await;
    let location = ObjectLocation::new("snapshots", "registry.json");
    fx.objects.put(location.clone(), "{}");
    fx.queue.send(format!(r#"{{"location": "{location}"}}"#));

    let listener = QueueListener::new(
        fx.queue.clone(),
        fx.objects.clone(),
        reload_fn(|| Box::pin(async { Err::<(), _>(std::io::Error::other("reload refused")) })),
        fx.store.path(),
    )
    .with_config(&ListenerConfig {
        max_messages: None,
        wait_seconds: Some(0),
    });

    assert_eq!(listener.poll_once().await.unwrap(), 0);
    assert_eq!(fx.queue.in_flight(), 1);
}

#[tokio::test]
async fn receive_errors_propagate_from_poll() {
    let fx = fixture().await;
    fx.queue.fail_receives(1);
    assert!(fx.listener().poll_once().await.is_err());
    assert_eq!(fx.listener().poll_once().await.unwrap(), 0);
}

#[tokio::test]
async fn spawned_listener_processes_until_stopped() {
    let fx = fixture().await;
    let reloads = Arc::new(AtomicUsize::new(0));
    let location = ObjectLocation::new("snapshots", "registry.json");
    fx.objects.put(
        location.clone(),
        snapshot(&fx.dir, "io.example/background", "3.0.0").await,
    );

    let listener = QueueListener::new(
        fx.queue.clone(),
        fx.objects.clone(),
        {
            let reloads = reloads.clone();
            let live = fx.store.clone();
            reload_fn(move || {
                let reloads = reloads.clone();
                let live = live.clone();
                Box::pin(async move {
                    live.reload().await?;
                    reloads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, store::StoreError>(())
                })
            })
        },
        fx.store.path(),
    )
    .with_config(&ListenerConfig {
        max_messages: Some(1),
        wait_seconds: Some(1),
    })
    .with_backoff(Duration::from_millis(10));

    let handle = listener.spawn(CancellationToken::new());
    fx.queue.fail_receives(1);
    fx.queue.send(format!(r#"{{"location": "{location}"}}"#));

    tokio::time::timeout(Duration::from_secs(10), async {
        while reloads.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener applied the snapshot");

    assert!(!handle.is_finished());
    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("listener stops");

    assert!(fx
        .store
        .check_version_exists("io.example/background", "3.0.0")
        .await
        .unwrap());
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let fx = fixture().await;
    fx.queue.fail_receives(usize::MAX);
    let cancel = CancellationToken::new();
    let handle = fx
        .listener()
        .with_backoff(Duration::from_secs(3600))
        .spawn(cancel.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("backoff is interruptible");
}
