use std::{fmt, sync::Arc};

use camino::Utf8Path;
use futures::future::BoxFuture;
use store::JsonFileStore;

use crate::error::{BoxError, SyncError};
use crate::object::Staged;

/// Applies a freshly downloaded snapshot.
#[async_trait::async_trait]
pub trait Reload: Send + Sync {
    /// Pick up the snapshot once it is in place at the target path.
    async fn reload(&self) -> Result<(), SyncError>;

    /// Move `staged` over `target` and apply it.
    ///
    /// The default renames the file and then calls [`Reload::reload`].
    async fn install(&self, staged: Staged, target: &Utf8Path) -> Result<(), SyncError> {
        staged.persist(target).await?;
        self.reload().await
    }
}

#[async_trait::async_trait]
impl Reload for JsonFileStore {
    async fn reload(&self) -> Result<(), SyncError> {
        JsonFileStore::reload(self).await?;
        Ok(())
    }

    /// Swaps file and state under the store's write lock when `target` is
    /// the store's own file.
    async fn install(&self, staged: Staged, target: &Utf8Path) -> Result<(), SyncError> {
        if target != self.path() {
            staged.persist(target).await?;
            return Reload::reload(self).await;
        }

        if self.install_snapshot(staged.path()).await? {
            staged.moved();
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<R> Reload for Arc<R>
where
    R: Reload + ?Sized,
{
    async fn reload(&self) -> Result<(), SyncError> {
        (**self).reload().await
    }

    async fn install(&self, staged: Staged, target: &Utf8Path) -> Result<(), SyncError> {
        (**self).install(staged, target).await
    }
}

/// A reload hook built from a closure. See [`reload_fn`].
pub struct ReloadFn<F> {
    f: F,
}

impl<F> fmt::Debug for ReloadFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadFn").finish_non_exhaustive()
    }
}

/// Adapt an async closure into a [`Reload`] hook.
///
/// ```
/// use registry_sync::reload_fn;
///
/// let hook = reload_fn(|| Box::pin(async { Ok::<_, std::io::Error>(()) }));
/// # let _ = hook;
/// ```
pub fn reload_fn<F, E>(f: F) -> ReloadFn<F>
where
    F: Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync,
    E: Into<BoxError>,
{
    ReloadFn { f }
}

#[async_trait::async_trait]
impl<F, E> Reload for ReloadFn<F>
where
    F: Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync,
    E: Into<BoxError> + Send + 'static,
{
    async fn reload(&self) -> Result<(), SyncError> {
        (self.f)().await.map_err(|error| SyncError::Reload(error.into()))
    }
}
