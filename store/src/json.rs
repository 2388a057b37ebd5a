//! Embedded backend: the whole registry mirrored to a single JSON file.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use eyre::WrapErr as _;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use store_driver::{
    publish_lock_key, touch, Cursor, Driver, Page, Records, RegistryExtensions, ServerFilter,
    ServerJson, ServerRecord, Status, StoreError, StoreErrorKind, Transaction,
};

use crate::locks::{LockRegistry, PublishGuard};

const ENGINE: &str = "json-file";

/// Implement `Records` by forwarding every call to a field.
macro_rules! forward_records {
    ($ty:ty => $field:ident) => {
        #[async_trait::async_trait]
        impl Records for $ty {
            async fn create_server(
                &self,
                server: ServerJson,
                meta: Option<RegistryExtensions>,
            ) -> Result<ServerRecord, StoreError> {
                self.$field.create_server(server, meta).await
            }

            async fn update_server(
                &self,
                name: &str,
                version: &str,
                server: ServerJson,
            ) -> Result<ServerRecord, StoreError> {
                self.$field.update_server(name, version, server).await
            }

            async fn set_server_status(
                &self,
                name: &str,
                version: &str,
                status: Status,
            ) -> Result<ServerRecord, StoreError> {
                self.$field.set_server_status(name, version, status).await
            }

            async fn unmark_as_latest(&self, name: &str) -> Result<(), StoreError> {
                self.$field.unmark_as_latest(name).await
            }

            async fn list_servers(
                &self,
                filter: Option<&ServerFilter>,
                cursor: Option<&Cursor>,
                limit: usize,
            ) -> Result<Page, StoreError> {
                self.$field.list_servers(filter, cursor, limit).await
            }

            async fn get_server_by_name(&self, name: &str) -> Result<ServerRecord, StoreError> {
                self.$field.get_server_by_name(name).await
            }

            async fn get_server_by_name_and_version(
                &self,
                name: &str,
                version: &str,
            ) -> Result<ServerRecord, StoreError> {
                self.$field.get_server_by_name_and_version(name, version).await
            }

            async fn get_all_versions_by_server_name(
                &self,
                name: &str,
            ) -> Result<Vec<ServerRecord>, StoreError> {
                self.$field.get_all_versions_by_server_name(name).await
            }

            async fn count_server_versions(&self, name: &str) -> Result<usize, StoreError> {
                self.$field.count_server_versions(name).await
            }

            async fn check_version_exists(
                &self,
                name: &str,
                version: &str,
            ) -> Result<bool, StoreError> {
                self.$field.check_version_exists(name, version).await
            }
        }
    };
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Dataset {
    #[serde(default)]
    servers: Vec<StoredRecord>,
}

/// One server version as stored on disk.
///
/// `value` is kept as raw JSON so that a single damaged payload does not
/// prevent the rest of the file from loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredRecord {
    server_name: String,
    version: String,
    status: Status,
    published_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_latest: bool,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

impl StoredRecord {
    fn is(&self, name: &str, version: &str) -> bool {
        self.server_name == name && self.version == version
    }

    fn meta(&self) -> RegistryExtensions {
        RegistryExtensions {
            status: self.status.clone(),
            published_at: self.published_at,
            updated_at: self.updated_at,
            is_latest: self.is_latest,
        }
    }

    /// Decode into a caller-facing record; `None` for tombstones.
    fn decode(&self) -> Option<ServerRecord> {
        let value = self.value.as_ref()?;
        match ServerJson::deserialize(value) {
            Ok(server) => Some(ServerRecord {
                server,
                meta: self.meta(),
            }),
            Err(error) => {
                tracing::debug!(
                    name = %self.server_name,
                    version = %self.version,
                    %error,
                    "skipping record with undecodable payload"
                );
                None
            }
        }
    }

    fn cursor(&self) -> Cursor {
        Cursor::new(&self.server_name, &self.version)
    }
}

impl Dataset {
    fn position(&self, name: &str, version: &str) -> Option<usize> {
        self.servers.iter().position(|record| record.is(name, version))
    }

    fn find_mut(&mut self, name: &str, version: &str) -> Option<&mut StoredRecord> {
        self.servers
            .iter_mut()
            .find(|record| record.is(name, version))
    }

    fn unmark_latest(&mut self, name: &str) -> bool {
        let mut changed = false;
        for record in self
            .servers
            .iter_mut()
            .filter(|record| record.server_name == name && record.is_latest)
        {
            record.is_latest = false;
            changed = true;
        }
        changed
    }

    fn page(&self, filter: Option<&ServerFilter>, cursor: Option<&Cursor>, limit: usize) -> Page {
        if limit == 0 {
            return Page::default();
        }

        // An unknown cursor restarts the scan from the beginning.
        let start = cursor
            .and_then(|cursor| self.position(&cursor.name, &cursor.version))
            .map(|index| index + 1)
            .unwrap_or(0);

        let mut matches = self.servers[start..].iter().filter_map(|stored| {
            let record = stored.decode()?;
            filter
                .map_or(true, |filter| filter.matches(&record.server, &record.meta))
                .then_some((stored, record))
        });

        let mut servers = Vec::with_capacity(limit);
        let mut last = None;
        for (stored, record) in matches.by_ref().take(limit) {
            last = Some(stored);
            servers.push(record);
        }

        let next = if servers.len() == limit && matches.next().is_some() {
            last.map(StoredRecord::cursor)
        } else {
            None
        };

        Page { servers, next }
    }
}

enum Loaded {
    Missing,
    Empty,
    Dataset(Dataset),
}

async fn read_dataset(path: &Utf8Path) -> Result<Loaded, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(error) => {
            return Err(StoreError::builder(ENGINE, StoreErrorKind::StorageFailure, error)
                .context(format!("read {path}"))
                .build())
        }
    };

    if bytes.is_empty() {
        return Ok(Loaded::Empty);
    }

    let dataset = serde_json::from_slice(&bytes)
        .wrap_err_with(|| format!("parse registry file {path}"))
        .map_err(StoreError::with(ENGINE))?;
    Ok(Loaded::Dataset(dataset))
}

/// Serialize the dataset and atomically replace the file at `path`.
async fn write_dataset(path: &Utf8Path, dataset: &Dataset) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(dataset)
        .wrap_err("serialize registry")
        .map_err(StoreError::with(ENGINE))?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .wrap_err("create parents of registry file")
            .map_err(StoreError::with(ENGINE))?;
    }

    let temp = temp_path(path);
    tokio::fs::write(&temp, &bytes)
        .await
        .wrap_err_with(|| format!("write {temp}"))
        .map_err(StoreError::with(ENGINE))?;

    if let Err(error) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(StoreError::builder(ENGINE, StoreErrorKind::StorageFailure, error)
            .context(format!("rename {temp} to {path}"))
            .build());
    }

    tracing::trace!(%path, bytes = bytes.len(), "persisted registry file");
    Ok(())
}

/// Sibling temporary file used for atomic replacement.
pub(crate) fn temp_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.tmp"))
}

#[derive(Debug)]
struct Inner {
    path: Utf8PathBuf,
    data: RwLock<Dataset>,
    locks: LockRegistry,
}

/// Registry store backed by a single JSON file.
///
/// Reads share an in-memory copy; every write replaces the file through a
/// temporary sibling and a rename. The locks are process-local: two
/// processes must not write the same file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    inner: Arc<Inner>,
}

impl JsonFileStore {
    /// Open the store at `path`, with its own lock registry.
    ///
    /// A missing file starts an empty registry; the file is created on the
    /// first write.
    pub async fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_locks(path, LockRegistry::new()).await
    }

    /// Open the store at `path`, sharing publish locks through `locks`.
    #[tracing::instrument(skip_all, fields(path = tracing::field::Empty))]
    pub async fn open_with_locks(
        path: impl Into<Utf8PathBuf>,
        locks: LockRegistry,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        tracing::Span::current().record("path", path.as_str());

        let data = match read_dataset(&path).await? {
            Loaded::Dataset(dataset) => dataset,
            Loaded::Missing | Loaded::Empty => Dataset::default(),
        };
        tracing::debug!(records = data.servers.len(), "opened registry file");

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                data: RwLock::new(data),
                locks,
            }),
        })
    }

    /// The file this store mirrors.
    pub fn path(&self) -> &Utf8Path {
        &self.inner.path
    }

    /// The publish locks shared by this store and its transactions.
    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }

    /// Replace the in-memory registry with the current file contents.
    ///
    /// A missing or empty file leaves the current state in place.
    #[tracing::instrument(skip(self), fields(path = %self.inner.path))]
    pub async fn reload(&self) -> Result<(), StoreError> {
        let mut data = self.inner.data.write().await;
        match read_dataset(&self.inner.path).await? {
            Loaded::Dataset(dataset) => {
                tracing::info!(records = dataset.servers.len(), "reloaded registry file");
                *data = dataset;
            }
            Loaded::Empty => tracing::debug!("registry file is empty, keeping current state"),
            Loaded::Missing => tracing::warn!("registry file is missing, keeping current state"),
        }
        Ok(())
    }

    /// Move a complete registry file at `snapshot` into place and load it.
    ///
    /// The snapshot is parsed first, then renamed over the store's file and
    /// swapped into memory while writers are held off, so no write can land
    /// between the two. A snapshot that fails to parse leaves both the file
    /// and the in-memory state untouched. An empty snapshot is ignored.
    ///
    /// Returns whether the snapshot was moved into place. `snapshot` should
    /// live on the same filesystem as the store's file.
    #[tracing::instrument(skip(self), fields(path = %self.inner.path))]
    pub async fn install_snapshot(&self, snapshot: &Utf8Path) -> Result<bool, StoreError> {
        let mut data = self.inner.data.write().await;
        let dataset = match read_dataset(snapshot).await? {
            Loaded::Dataset(dataset) => dataset,
            Loaded::Empty => {
                tracing::warn!(%snapshot, "snapshot is empty, keeping current state");
                return Ok(false);
            }
            Loaded::Missing => {
                return Err(StoreError::new(
                    ENGINE,
                    StoreErrorKind::StorageFailure,
                    format!("snapshot {snapshot} does not exist"),
                ))
            }
        };

        if let Err(error) = tokio::fs::rename(snapshot, &self.inner.path).await {
            return Err(StoreError::builder(ENGINE, StoreErrorKind::StorageFailure, error)
                .context(format!("rename {snapshot} to {}", self.inner.path))
                .build());
        }

        tracing::info!(records = dataset.servers.len(), "installed registry snapshot");
        *data = dataset;
        Ok(true)
    }

    /// Apply `f` to a copy of the dataset, persist it, then publish it.
    ///
    /// Readers never see a state that failed to reach the file.
    async fn mutate<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Dataset) -> Result<T, StoreError>,
    {
        let mut data = self.inner.data.write().await;
        let mut next = data.clone();
        let value = f(&mut next)?;
        write_dataset(&self.inner.path, &next).await?;
        *data = next;
        Ok(value)
    }
}

#[async_trait::async_trait]
impl Records for JsonFileStore {
    async fn create_server(
        &self,
        server: ServerJson,
        meta: Option<RegistryExtensions>,
    ) -> Result<ServerRecord, StoreError> {
        let value = serde_json::to_value(&server)
            .wrap_err("serialize server payload")
            .map_err(StoreError::with(ENGINE))?;
        let meta = meta
            .unwrap_or_else(|| RegistryExtensions::published(Utc::now()))
            .normalized();

        self.mutate(move |data| {
            if data.position(&server.name, &server.version).is_some() {
                return Err(StoreError::already_exists(
                    ENGINE,
                    &server.name,
                    &server.version,
                ));
            }

            if meta.is_latest {
                data.unmark_latest(&server.name);
            }

            data.servers.push(StoredRecord {
                server_name: server.name.clone(),
                version: server.version.clone(),
                status: meta.status.clone(),
                published_at: meta.published_at,
                updated_at: meta.updated_at,
                is_latest: meta.is_latest,
                value: Some(value),
            });

            Ok(ServerRecord { server, meta })
        })
        .await
    }

    async fn update_server(
        &self,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> Result<ServerRecord, StoreError> {
        let value = serde_json::to_value(&server)
            .wrap_err("serialize server payload")
            .map_err(StoreError::with(ENGINE))?;

        self.mutate(move |data| {
            let record = data
                .find_mut(name, version)
                .ok_or_else(|| StoreError::not_found(ENGINE, name, Some(version)))?;
            record.value = Some(value);
            record.updated_at = touch(record.updated_at, Utc::now());
            Ok(ServerRecord {
                server,
                meta: record.meta(),
            })
        })
        .await
    }

    async fn set_server_status(
        &self,
        name: &str,
        version: &str,
        status: Status,
    ) -> Result<ServerRecord, StoreError> {
        self.mutate(move |data| {
            let record = data
                .find_mut(name, version)
                .ok_or_else(|| StoreError::not_found(ENGINE, name, Some(version)))?;
            record.status = status;
            record.updated_at = touch(record.updated_at, Utc::now());
            record
                .decode()
                .ok_or_else(|| StoreError::not_found(ENGINE, name, Some(version)))
        })
        .await
    }

    async fn unmark_as_latest(&self, name: &str) -> Result<(), StoreError> {
        let mut data = self.inner.data.write().await;
        if !data
            .servers
            .iter()
            .any(|record| record.server_name == name && record.is_latest)
        {
            return Ok(());
        }

        let mut next = data.clone();
        next.unmark_latest(name);
        write_dataset(&self.inner.path, &next).await?;
        *data = next;
        Ok(())
    }

    async fn list_servers(
        &self,
        filter: Option<&ServerFilter>,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let data = self.inner.data.read().await;
        Ok(data.page(filter, cursor, limit))
    }

    async fn get_server_by_name(&self, name: &str) -> Result<ServerRecord, StoreError> {
        let data = self.inner.data.read().await;
        data.servers
            .iter()
            .filter(|record| record.server_name == name && record.is_latest)
            .find_map(StoredRecord::decode)
            .ok_or_else(|| StoreError::not_found(ENGINE, name, None))
    }

    async fn get_server_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ServerRecord, StoreError> {
        let data = self.inner.data.read().await;
        data.servers
            .iter()
            .find(|record| record.is(name, version))
            .and_then(StoredRecord::decode)
            .ok_or_else(|| StoreError::not_found(ENGINE, name, Some(version)))
    }

    async fn get_all_versions_by_server_name(
        &self,
        name: &str,
    ) -> Result<Vec<ServerRecord>, StoreError> {
        let data = self.inner.data.read().await;

        // Reverse append order first, so the stable sort puts the later of two
        // versions published at the same instant first.
        let mut versions: Vec<ServerRecord> = data
            .servers
            .iter()
            .rev()
            .filter(|record| record.server_name == name)
            .filter_map(StoredRecord::decode)
            .collect();
        versions.sort_by(|a, b| b.meta.published_at.cmp(&a.meta.published_at));

        if versions.is_empty() {
            return Err(StoreError::not_found(ENGINE, name, None));
        }
        Ok(versions)
    }

    async fn count_server_versions(&self, name: &str) -> Result<usize, StoreError> {
        let data = self.inner.data.read().await;
        Ok(data
            .servers
            .iter()
            .filter(|record| record.server_name == name)
            .count())
    }

    async fn check_version_exists(&self, name: &str, version: &str) -> Result<bool, StoreError> {
        let data = self.inner.data.read().await;
        Ok(data.position(name, version).is_some())
    }
}

#[async_trait::async_trait]
impl Driver for JsonFileStore {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        Ok(Box::new(JsonFileTransaction {
            store: self.clone(),
            held: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    #[tracing::instrument(skip(self), fields(path = %self.inner.path))]
    async fn close(&self) -> Result<(), StoreError> {
        let data = self.inner.data.write().await;
        write_dataset(&self.inner.path, &data).await
    }
}

/// Lock scope for the embedded backend.
///
/// Writes go straight to the store; the transaction only holds publish
/// locks, which are released when it is committed, rolled back or dropped.
#[derive(Debug)]
pub struct JsonFileTransaction {
    store: JsonFileStore,
    held: parking_lot::Mutex<Vec<PublishGuard>>,
}

impl JsonFileTransaction {
    fn holds(&self, key: u64) -> bool {
        self.held.lock().iter().any(|guard| guard.key() == key)
    }

    fn release(&self) {
        let released = std::mem::take(&mut *self.held.lock());
        if !released.is_empty() {
            tracing::trace!(locks = released.len(), "releasing publish locks");
        }
    }
}

forward_records!(JsonFileTransaction => store);

#[async_trait::async_trait]
impl Transaction for JsonFileTransaction {
    async fn acquire_publish_lock(&self, name: &str) -> Result<(), StoreError> {
        if self.holds(publish_lock_key(name)) {
            return Ok(());
        }
        let guard = self.store.inner.locks.acquire(name).await;
        self.held.lock().push(guard);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.release();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        tracing::debug!("rolling back lock scope, persisted writes are kept");
        self.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use store_driver::Remote;

    fn server(name: &str, version: &str) -> ServerJson {
        ServerJson::new(name, version).with_description(format!("{name} {version}"))
    }

    async fn store() -> (tempfile::TempDir, JsonFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("registry.json")).unwrap();
        let store = JsonFileStore::open(path).await.unwrap();
        (dir, store)
    }

    async fn latest_count(store: &JsonFileStore, name: &str) -> usize {
        store
            .list_servers(
                Some(&ServerFilter::default().name(name).latest(true)),
                None,
                100,
            )
            .await
            .unwrap()
            .servers
            .len()
    }

    #[tokio::test]
    async fn create_then_get_returns_payload() {
        let (_dir, store) = store().await;
        let payload = server("io.example/foo", "1.0.0")
            .with_remote(Remote::new("sse", "https://foo.example/sse"));

        let created = store.create_server(payload.clone(), None).await.unwrap();
        assert!(created.meta.is_latest);
        assert_eq!(created.meta.status, Status::Active);
        assert_eq!(created.meta.published_at, created.meta.updated_at);

        let fetched = store
            .get_server_by_name_and_version("io.example/foo", "1.0.0")
            .await
            .unwrap();
        assert_eq!(fetched.server, payload);
        assert!(store
            .check_version_exists("io.example/foo", "1.0.0")
            .await
            .unwrap());
        assert!(!store
            .check_version_exists("io.example/foo", "2.0.0")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let (_dir, store) = store().await;
        store
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();
        let err = store
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::AlreadyExists);
        assert_eq!(store.count_server_versions("io.example/foo").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn creating_latest_unmarks_previous() {
        let (_dir, store) = store().await;
        store
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();
        store
            .create_server(server("io.example/foo", "1.1.0"), None)
            .await
            .unwrap();
        store
            .create_server(server("io.example/bar", "0.1.0"), None)
            .await
            .unwrap();

        assert_eq!(latest_count(&store, "io.example/foo").await, 1);
        assert_eq!(latest_count(&store, "io.example/bar").await, 1);

        let latest = store.get_server_by_name("io.example/foo").await.unwrap();
        assert_eq!(latest.version(), "1.1.0");
    }

    #[tokio::test]
    async fn unmark_is_idempotent() {
        let (_dir, store) = store().await;
        store.unmark_as_latest("io.example/none").await.unwrap();

        store
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();
        store.unmark_as_latest("io.example/foo").await.unwrap();
        store.unmark_as_latest("io.example/foo").await.unwrap();

        assert_eq!(latest_count(&store, "io.example/foo").await, 0);
        let err = store.get_server_by_name("io.example/foo").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn update_and_status_bump_updated_at() {
        let (_dir, store) = store().await;
        let created = store
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();

        let edited = server("io.example/foo", "1.0.0").with_description("edited");
        let updated = store
            .update_server("io.example/foo", "1.0.0", edited.clone())
            .await
            .unwrap();
        assert_eq!(updated.server, edited);
        assert!(updated.meta.is_latest);
        assert!(updated.meta.updated_at >= created.meta.updated_at);

        let deprecated = store
            .set_server_status("io.example/foo", "1.0.0", Status::Deprecated)
            .await
            .unwrap();
        assert_eq!(deprecated.meta.status, Status::Deprecated);
        assert_eq!(deprecated.server, edited);
        assert!(deprecated.meta.updated_at >= deprecated.meta.published_at);

        let err = store
            .update_server("io.example/foo", "9.9.9", edited)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = store
            .set_server_status("io.example/missing", "1.0.0", Status::Deleted)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn versions_sorted_by_publish_time_descending() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        for (version, offset) in [("1.0.0", 0), ("0.9.0", -10), ("1.1.0", 10)] {
            let published = now + Duration::seconds(offset);
            let meta = RegistryExtensions {
                is_latest: false,
                ..RegistryExtensions::published(published)
            };
            store
                .create_server(server("io.example/foo", version), Some(meta))
                .await
                .unwrap();
        }

        let versions: Vec<_> = store
            .get_all_versions_by_server_name("io.example/foo")
            .await
            .unwrap()
            .iter()
            .map(|record| record.version().to_owned())
            .collect();
        assert_eq!(versions, ["1.1.0", "1.0.0", "0.9.0"]);

        let err = store
            .get_all_versions_by_server_name("io.example/missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn pagination_visits_every_match_once() {
        let (_dir, store) = store().await;
        for i in 0..7 {
            store
                .create_server(server(&format!("io.example/s{i}"), "1.0.0"), None)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        let mut pages = 0;
        loop {
            let page = store.list_servers(None, cursor.as_ref(), 3).await.unwrap();
            pages += 1;
            seen.extend(page.servers.iter().map(|r| r.name().to_owned()));
            match page.next {
                Some(next) => {
                    assert_eq!(page.servers.len(), 3);
                    cursor = Some(next);
                }
                None => break,
            }
        }

        assert_eq!(pages, 3);
        let expected: Vec<_> = (0..7).map(|i| format!("io.example/s{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn last_full_page_has_no_cursor() {
        let (_dir, store) = store().await;
        for i in 0..4 {
            store
                .create_server(server(&format!("io.example/s{i}"), "1.0.0"), None)
                .await
                .unwrap();
        }
        store
            .create_server(server("io.other/x", "1.0.0"), None)
            .await
            .unwrap();

        let filter = ServerFilter::default().substring_name("EXAMPLE");
        let first = store.list_servers(Some(&filter), None, 2).await.unwrap();
        assert_eq!(first.servers.len(), 2);
        let second = store
            .list_servers(Some(&filter), first.next.as_ref(), 2)
            .await
            .unwrap();
        assert_eq!(second.servers.len(), 2);
        assert_eq!(second.next, None);
    }

    #[tokio::test]
    async fn unknown_cursor_restarts_scan() {
        let (_dir, store) = store().await;
        store
            .create_server(server("io.example/a", "1.0.0"), None)
            .await
            .unwrap();
        let page = store
            .list_servers(None, Some(&Cursor::new("io.example/gone", "1.0.0")), 10)
            .await
            .unwrap();
        assert_eq!(page.servers.len(), 1);
        assert!(store.list_servers(None, None, 0).await.unwrap().servers.is_empty());
    }

    #[tokio::test]
    async fn corrupt_payloads_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("registry.json")).unwrap();
        let now = Utc::now().to_rfc3339();
        let document = serde_json::json!({
            "servers": [
                {
                    "server_name": "io.example/broken", "version": "1.0.0", "status": "active",
                    "published_at": now, "updated_at": now, "is_latest": true, "value": null
                },
                {
                    "server_name": "io.example/garbled", "version": "1.0.0", "status": "active",
                    "published_at": now, "updated_at": now, "is_latest": true, "value": 42
                },
                {
                    "server_name": "io.example/ok", "version": "1.0.0", "status": "active",
                    "published_at": now, "updated_at": now, "is_latest": true,
                    "value": {"name": "io.example/ok", "version": "1.0.0"}
                }
            ]
        });
        std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

        let store = JsonFileStore::open(path).await.unwrap();
        let page = store.list_servers(None, None, 1).await.unwrap();
        assert_eq!(page.servers.len(), 1);
        assert_eq!(page.servers[0].name(), "io.example/ok");
        assert_eq!(page.next, None);

        assert!(store
            .get_server_by_name("io.example/broken")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .check_version_exists("io.example/broken", "1.0.0")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn save_then_reload_round_trips() {
        let (_dir, store) = store().await;
        store
            .create_server(
                server("io.example/foo", "1.0.0")
                    .with_remote(Remote::new("sse", "https://foo.example/sse")),
                None,
            )
            .await
            .unwrap();
        store
            .create_server(server("io.example/foo", "1.1.0"), None)
            .await
            .unwrap();
        store
            .set_server_status("io.example/foo", "1.0.0", Status::Deprecated)
            .await
            .unwrap();

        let before = store.inner.data.read().await.clone();
        assert!(!temp_path(store.path()).exists());

        let reopened = JsonFileStore::open(store.path().to_owned()).await.unwrap();
        assert_eq!(*reopened.inner.data.read().await, before);

        store.reload().await.unwrap();
        assert_eq!(*store.inner.data.read().await, before);
    }

    #[tokio::test]
    async fn reload_keeps_state_for_empty_or_missing_file() {
        let (_dir, store) = store().await;
        store
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();

        std::fs::write(store.path(), b"").unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.count_server_versions("io.example/foo").await.unwrap(), 1);

        std::fs::remove_file(store.path()).unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.count_server_versions("io.example/foo").await.unwrap(), 1);

        std::fs::write(store.path(), b"{not json").unwrap();
        let err = store.reload().await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::StorageFailure);
        assert_eq!(store.count_server_versions("io.example/foo").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reload_picks_up_replaced_file() {
        let (dir, store) = store().await;
        let other_path = Utf8PathBuf::from_path_buf(dir.path().join("other.json")).unwrap();
        let other = JsonFileStore::open(other_path.clone()).await.unwrap();
        other
            .create_server(server("io.example/remote", "2.0.0"), None)
            .await
            .unwrap();

        std::fs::rename(&other_path, store.path()).unwrap();
        store.reload().await.unwrap();

        let latest = store.get_server_by_name("io.example/remote").await.unwrap();
        assert_eq!(latest.version(), "2.0.0");
    }

    #[tokio::test]
    async fn install_snapshot_replaces_file_and_state() {
        let (dir, store) = store().await;
        store
            .create_server(server("io.example/local", "1.0.0"), None)
            .await
            .unwrap();

        let staged = Utf8PathBuf::from_path_buf(dir.path().join("staged.json")).unwrap();
        let remote = JsonFileStore::open(staged.clone()).await.unwrap();
        remote
            .create_server(server("io.example/remote", "2.0.0"), None)
            .await
            .unwrap();

        assert!(store.install_snapshot(&staged).await.unwrap());
        assert!(!staged.exists());
        assert_eq!(
            store.get_server_by_name("io.example/remote").await.unwrap().version(),
            "2.0.0"
        );
        assert!(!store.check_version_exists("io.example/local", "1.0.0").await.unwrap());

        // Later writes build on the installed snapshot.
        store
            .create_server(server("io.example/after", "1.0.0"), None)
            .await
            .unwrap();
        let reopened = JsonFileStore::open(store.path().to_owned()).await.unwrap();
        assert_eq!(reopened.count_server_versions("io.example/remote").await.unwrap(), 1);
        assert_eq!(reopened.count_server_versions("io.example/after").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn install_snapshot_rejects_corrupt_file() {
        let (dir, store) = store().await;
        store
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let staged = Utf8PathBuf::from_path_buf(dir.path().join("staged.json")).unwrap();
        std::fs::write(&staged, b"{\"servers\": [{\"server_name\"").unwrap();
        let err = store.install_snapshot(&staged).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::StorageFailure);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        assert_eq!(store.count_server_versions("io.example/foo").await.unwrap(), 1);

        std::fs::write(&staged, b"").unwrap();
        assert!(!store.install_snapshot(&staged).await.unwrap());
        assert_eq!(std::fs::read(store.path()).unwrap(), before);

        std::fs::remove_file(&staged).unwrap();
        assert!(store.install_snapshot(&staged).await.is_err());
        assert_eq!(store.count_server_versions("io.example/foo").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_lock_blocks_second_transaction_until_commit() {
        let (_dir, store) = store().await;

        let first = store.begin().await.unwrap();
        first.acquire_publish_lock("io.example/foo").await.unwrap();

        let second = store.begin().await.unwrap();
        let mut waiter = tokio::spawn(async move {
            second.acquire_publish_lock("io.example/foo").await?;
            second
                .create_server(server("io.example/foo", "2.0.0"), None)
                .await?;
            second.commit().await
        });

        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut waiter).await;
        assert!(pending.is_err(), "second transaction must wait for the lock");

        first
            .create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();
        first.commit().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("lock released by commit")
            .unwrap()
            .unwrap();

        let versions = store
            .get_all_versions_by_server_name("io.example/foo")
            .await
            .unwrap();
        let versions: Vec<_> = versions.iter().map(|record| record.version()).collect();
        assert_eq!(versions, ["2.0.0", "1.0.0"]);
        assert_eq!(latest_count(&store, "io.example/foo").await, 1);
    }

    #[tokio::test]
    async fn transaction_releases_locks_on_commit_and_rollback() {
        let (_dir, store) = store().await;

        let tx = store.begin().await.unwrap();
        tx.acquire_publish_lock("io.example/foo").await.unwrap();
        tx.acquire_publish_lock("io.example/foo").await.unwrap();
        tx.create_server(server("io.example/foo", "1.0.0"), None)
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        // Writes in a lock scope are not undone.
        assert_eq!(store.count_server_versions("io.example/foo").await.unwrap(), 1);

        let tx = store.begin().await.unwrap();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            tx.acquire_publish_lock("io.example/foo"),
        )
        .await
        .expect("lock released by rollback")
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.locks().len(), 1);
    }
}
