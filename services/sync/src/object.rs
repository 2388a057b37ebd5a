use std::{collections::HashMap, fmt};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use tokio::io::{self, AsyncWriteExt};

use crate::error::SyncError;
use crate::location::ObjectLocation;

/// A writer stream for downloaded contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Read access to an object store.
#[async_trait::async_trait]
pub trait ObjectStore: fmt::Debug + Send + Sync {
    /// The name of the object store.
    fn name(&self) -> &'static str;

    /// Stream an object into `writer`, returning the number of bytes written.
    async fn download(
        &self,
        location: &ObjectLocation,
        writer: &mut Writer<'_>,
    ) -> Result<u64, SyncError>;

    /// Download an object into a staging file next to `target`.
    ///
    /// Each call gets its own uniquely named staging file, so concurrent
    /// downloads and other writers of `target` never share a temporary. The
    /// staging file is removed if the download fails or the returned
    /// [`Staged`] is dropped without being persisted.
    async fn download_staged(
        &self,
        location: &ObjectLocation,
        target: &Utf8Path,
    ) -> Result<Staged, SyncError> {
        tracing::trace!(%location, %target, "Staging download for: {target}");

        let dir = match target.parent().filter(|p| !p.as_str().is_empty()) {
            Some(parent) => parent.to_owned(),
            None => Utf8PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(SyncError::io(dir.clone()))?;

        let temp = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(SyncError::io(dir.clone()))?
            .into_temp_path();
        let path = Utf8PathBuf::from_path_buf(temp.to_path_buf()).map_err(|path| {
            SyncError::io(dir.clone())(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("staging path is not UTF-8: {}", path.display()),
            ))
        })?;

        let size = write_temp(self, location, &path).await?;
        tracing::debug!(%location, staged = %path, bytes = size, "downloaded object");
        Ok(Staged { temp, path, size })
    }

    /// Download an object into a local file.
    ///
    /// The object is staged next to `target` and renamed over it once
    /// complete, so readers of `target` see either the old or the new
    /// contents.
    async fn download_file(
        &self,
        location: &ObjectLocation,
        target: &Utf8Path,
    ) -> Result<u64, SyncError> {
        let staged = self.download_staged(location, target).await?;
        let size = staged.size();
        staged.persist(target).await?;
        Ok(size)
    }
}

/// A completed download waiting in its staging file.
///
/// Dropping it removes the staging file.
#[derive(Debug)]
pub struct Staged {
    temp: tempfile::TempPath,
    path: Utf8PathBuf,
    size: u64,
}

impl Staged {
    /// Where the downloaded bytes are.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Number of bytes downloaded.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Rename the staging file over `target`.
    pub async fn persist(self, target: &Utf8Path) -> Result<(), SyncError> {
        tokio::fs::rename(&self.path, target)
            .await
            .map_err(SyncError::io(target))?;
        self.moved();
        Ok(())
    }

    /// Record that the staging file was moved elsewhere, so dropping this
    /// no longer removes anything.
    pub fn moved(self) {
        let _ = self.temp.keep();
    }
}

async fn write_temp<S>(store: &S, location: &ObjectLocation, temp: &Utf8Path) -> Result<u64, SyncError>
where
    S: ObjectStore + ?Sized,
{
    let mut file = io::BufWriter::new(
        tokio::fs::File::create(temp)
            .await
            .map_err(SyncError::io(temp))?,
    );
    let written = store.download(location, &mut file).await?;
    file.shutdown().await.map_err(SyncError::io(temp))?;
    Ok(written)
}

#[async_trait::async_trait]
impl<S> ObjectStore for std::sync::Arc<S>
where
    S: ObjectStore + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn download(
        &self,
        location: &ObjectLocation,
        writer: &mut Writer<'_>,
    ) -> Result<u64, SyncError> {
        (**self).download(location, writer).await
    }
}

/// Object store kept in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectLocation, Bytes>>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `contents` at `location`, replacing any previous object.
    pub fn put(&self, location: ObjectLocation, contents: impl Into<Bytes>) {
        self.objects.write().insert(location, contents.into());
    }

    /// Remove the object at `location`.
    pub fn remove(&self, location: &ObjectLocation) -> Option<Bytes> {
        self.objects.write().remove(location)
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn download(
        &self,
        location: &ObjectLocation,
        writer: &mut Writer<'_>,
    ) -> Result<u64, SyncError> {
        let contents = self
            .objects
            .read()
            .get(location)
            .cloned()
            .ok_or_else(|| SyncError::ObjectNotFound {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
            })?;

        writer
            .write_all(&contents)
            .await
            .map_err(|source| SyncError::Download {
                engine: self.name(),
                bucket: location.bucket.clone(),
                key: location.key.clone(),
                source: source.into(),
            })?;
        Ok(contents.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
    }

    fn entries(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn download_file_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir, "nested/registry.json");
        let store = MemoryObjectStore::new();
        let location = ObjectLocation::new("bucket", "registry.json");

        store.put(location.clone(), "first");
        assert_eq!(store.download_file(&location, &target).await.unwrap(), 5);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "first");

        store.put(location.clone(), "second");
        store.download_file(&location, &target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        assert_eq!(entries(&dir.path().join("nested")), ["registry.json"]);
    }

    #[tokio::test]
    async fn staged_downloads_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir, "registry.json");
        let store = MemoryObjectStore::new();
        let location = ObjectLocation::new("bucket", "registry.json");
        store.put(location.clone(), "snapshot");

        let first = store.download_staged(&location, &target).await.unwrap();
        let second = store.download_staged(&location, &target).await.unwrap();
        assert_ne!(first.path(), second.path());
        assert_ne!(first.path().as_str(), format!("{target}.tmp"));
        assert_eq!(first.size(), 8);
        assert!(!target.exists());

        let leftover = second.path().to_owned();
        drop(second);
        assert!(!leftover.exists());

        first.persist(&target).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "snapshot");
        assert_eq!(entries(dir.path()), ["registry.json"]);
    }

    #[tokio::test]
    async fn missing_object_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = target(&dir, "registry.json");
        std::fs::write(&target, "keep").unwrap();

        let store = MemoryObjectStore::new();
        let err = store
            .download_file(&ObjectLocation::new("bucket", "missing.json"), &target)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::ObjectNotFound { .. }));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "keep");
        assert_eq!(entries(dir.path()), ["registry.json"]);
    }
}
