//! # Registry stores
//!
//! Configuration and unification for the registry storage backends.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;

pub(crate) mod json;
/// Publish locks for the embedded backend.
pub mod locks;
#[cfg(feature = "postgres")]
pub(crate) mod postgres;

#[doc(inline)]
pub use json::{JsonFileStore, JsonFileTransaction};
#[doc(inline)]
pub use locks::{LockRegistry, PublishGuard};
#[cfg(feature = "postgres")]
#[doc(inline)]
pub use postgres::{PostgresStore, PostgresTransaction};

#[doc(inline)]
pub use store_driver::{
    BoxFut, Cursor, Driver, Page, Records, RegistryExtensions, Remote, ServerFilter,
    ServerJson, ServerRecord, Status, StoreError, StoreErrorKind, Transaction,
};

fn default_max_connections() -> u32 {
    5
}

/// Backend selection, as read from the service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum StoreConfig {
    /// A single JSON file, mirrored in memory.
    JsonFile {
        /// Location of the registry file. Created on the first write.
        path: Utf8PathBuf,
    },

    /// A PostgreSQL database.
    #[cfg(feature = "postgres")]
    Postgres {
        /// Connection URL, e.g. `postgres://localhost/registry`.
        url: String,

        /// Pool size. Defaults to 5.
        #[serde(default = "default_max_connections", alias = "max-connections")]
        max_connections: u32,
    },
}

impl StoreConfig {
    /// Open the configured backend.
    ///
    /// An empty file path or database URL is a `Configuration` error.
    #[tracing::instrument(skip(self))]
    pub async fn build(self) -> Result<Backend, StoreError> {
        let backend = match self {
            StoreConfig::JsonFile { path } => {
                if path.as_str().trim().is_empty() {
                    return Err(StoreError::configuration(
                        "json-file",
                        "json-file backend needs a path",
                    ));
                }
                Backend::JsonFile(JsonFileStore::open(path).await?)
            }
            #[cfg(feature = "postgres")]
            StoreConfig::Postgres {
                url,
                max_connections,
            } => {
                if url.trim().is_empty() {
                    return Err(StoreError::configuration(
                        "postgres",
                        "postgres backend needs a url",
                    ));
                }
                Backend::Postgres(PostgresStore::connect(&url, max_connections).await?)
            }
        };
        tracing::info!(backend = backend.name(), "store ready");
        Ok(backend)
    }
}

/// A constructed backend, keeping its concrete type for backend-specific
/// wiring such as hot reload.
#[derive(Debug, Clone)]
pub enum Backend {
    /// The embedded file store.
    JsonFile(JsonFileStore),

    /// The relational store.
    #[cfg(feature = "postgres")]
    Postgres(PostgresStore),
}

impl Backend {
    /// Name of the configured backend.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::JsonFile(store) => store.name(),
            #[cfg(feature = "postgres")]
            Backend::Postgres(store) => store.name(),
        }
    }

    /// The embedded store, if that is the configured backend.
    pub fn as_json_file(&self) -> Option<&JsonFileStore> {
        match self {
            Backend::JsonFile(store) => Some(store),
            #[cfg(feature = "postgres")]
            Backend::Postgres(_) => None,
        }
    }

    /// A shared handle over this backend.
    pub fn store(&self) -> Store {
        match self {
            Backend::JsonFile(store) => Store::new(store.clone()),
            #[cfg(feature = "postgres")]
            Backend::Postgres(store) => Store::new(store.clone()),
        }
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver>;

/// Shared handle to a storage backend.
#[derive(Debug, Clone)]
pub struct Store {
    driver: ArcDriver,
}

impl<D> From<D> for Store
where
    D: Driver + 'static,
{
    fn from(value: D) -> Self {
        Store::new(value)
    }
}

impl Store {
    /// Wrap a driver in a shared handle.
    pub fn new<D: Driver + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Name of the backend behind this handle.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// The backend as a trait object, for callers that need the raw contract.
    pub fn driver(&self) -> &ArcDriver {
        &self.driver
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`. A
    /// failed rollback is logged and the error from `f` is returned. Publish
    /// locks taken inside `f` are released on every path, including when the
    /// returned future is dropped before completion.
    ///
    /// ```rust,no_run
    /// # async fn example(store: store::Store) -> Result<(), store::StoreError> {
    /// let exists = store
    ///     .in_transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.acquire_publish_lock("io.example/foo").await?;
    ///             tx.check_version_exists("io.example/foo", "1.0.0").await
    ///         })
    ///     })
    ///     .await?;
    /// # let _ = exists;
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(skip_all, fields(driver = self.driver.name()))]
    pub async fn in_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t dyn Transaction) -> BoxFut<'t, Result<T, E>>,
        E: From<StoreError>,
    {
        let tx = self.driver.begin().await?;
        let outcome = f(&*tx).await;
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                tracing::trace!("transaction committed");
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "rollback failed");
                } else {
                    tracing::trace!("transaction rolled back");
                }
                Err(error)
            }
        }
    }

    /// Insert a new server version. See [`Records::create_server`].
    #[tracing::instrument(skip(self, server), fields(driver = self.driver.name(), name = %server.name, version = %server.version))]
    pub async fn create_server(
        &self,
        server: ServerJson,
        meta: Option<RegistryExtensions>,
    ) -> Result<ServerRecord, StoreError> {
        self.driver.create_server(server, meta).await
    }

    /// Replace the payload of an existing version.
    #[tracing::instrument(skip(self, server), fields(driver = self.driver.name()))]
    pub async fn update_server(
        &self,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> Result<ServerRecord, StoreError> {
        self.driver.update_server(name, version, server).await
    }

    /// Change the status of an existing version.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn set_server_status(
        &self,
        name: &str,
        version: &str,
        status: Status,
    ) -> Result<ServerRecord, StoreError> {
        self.driver.set_server_status(name, version, status).await
    }

    /// Clear the latest flag on every version of `name`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn unmark_as_latest(&self, name: &str) -> Result<(), StoreError> {
        self.driver.unmark_as_latest(name).await
    }

    /// List servers matching `filter`, resuming after `cursor`.
    ///
    /// The cursor is the opaque token returned with the previous page. An
    /// unparsable token restarts the listing from the beginning.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn list_servers(
        &self,
        filter: Option<&ServerFilter>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let cursor = cursor.and_then(|token| {
            let parsed = Cursor::parse(token);
            if parsed.is_none() {
                tracing::debug!(%token, "ignoring malformed cursor");
            }
            parsed
        });
        self.driver
            .list_servers(filter, cursor.as_ref(), limit)
            .await
    }

    /// The current latest version of `name`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn get_server_by_name(&self, name: &str) -> Result<ServerRecord, StoreError> {
        self.driver.get_server_by_name(name).await
    }

    /// One specific version of `name`.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn get_server_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ServerRecord, StoreError> {
        self.driver
            .get_server_by_name_and_version(name, version)
            .await
    }

    /// Every version of `name`, most recently published first.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn get_all_versions_by_server_name(
        &self,
        name: &str,
    ) -> Result<Vec<ServerRecord>, StoreError> {
        self.driver.get_all_versions_by_server_name(name).await
    }

    /// Number of versions stored for `name`.
    pub async fn count_server_versions(&self, name: &str) -> Result<usize, StoreError> {
        self.driver.count_server_versions(name).await
    }

    /// Whether `name@version` is stored.
    pub async fn check_version_exists(&self, name: &str, version: &str) -> Result<bool, StoreError> {
        self.driver.check_version_exists(name, version).await
    }

    /// Flush and release the backend.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn close(&self) -> Result<(), StoreError> {
        self.driver.close().await
    }
}
