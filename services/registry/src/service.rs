use store::{Page, ServerFilter, ServerJson, ServerRecord, Status, Store, Transaction};

use crate::error::{RegistryError, RegistryResult};

/// Default page size for listings.
pub const DEFAULT_LIMIT: usize = 30;

/// Largest page a caller may ask for.
pub const MAX_LIMIT: usize = 100;

/// Registry operations on top of a [`Store`].
#[derive(Debug, Clone)]
pub struct RegistryService {
    store: Store,
}

/// Check that `name` is `namespace/server` with both parts present.
pub fn validate_name(name: &str) -> RegistryResult<()> {
    match name.split_once('/') {
        Some((namespace, server)) if !namespace.is_empty() && !server.is_empty() => Ok(()),
        _ => Err(RegistryError::InvalidName(name.to_owned())),
    }
}

fn validate(server: &ServerJson) -> RegistryResult<()> {
    validate_name(&server.name)?;
    if server.version.trim().is_empty() {
        return Err(RegistryError::InvalidVersion(server.name.clone()));
    }
    Ok(())
}

impl RegistryService {
    /// A service over `store`.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Publish a new version and make it the latest.
    ///
    /// Publishes of the same server name are serialized by the publish lock,
    /// so concurrent publishes of different versions never both end up
    /// latest, and a duplicate version is always reported as such.
    #[tracing::instrument(skip(self, server), fields(name = %server.name, version = %server.version))]
    pub async fn publish(&self, server: ServerJson) -> RegistryResult<ServerRecord> {
        validate(&server)?;

        let record = self
            .store
            .in_transaction(|tx| Box::pin(publish_in(tx, server)))
            .await?;

        tracing::info!("published");
        Ok(record)
    }

    /// Replace the payload of a published version.
    #[tracing::instrument(skip(self, server))]
    pub async fn edit(
        &self,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> RegistryResult<ServerRecord> {
        if server.name != name || server.version != version {
            return Err(RegistryError::KeyMismatch {
                expected: format!("{name}@{version}"),
                actual: format!("{}@{}", server.name, server.version),
            });
        }
        Ok(self.store.update_server(name, version, server).await?)
    }

    /// Change the lifecycle status of a version.
    #[tracing::instrument(skip(self))]
    pub async fn set_status(
        &self,
        name: &str,
        version: &str,
        status: Status,
    ) -> RegistryResult<ServerRecord> {
        let record = self.store.set_server_status(name, version, status).await?;
        tracing::info!(status = %record.meta.status, "status changed");
        Ok(record)
    }

    /// The latest version of `name`.
    pub async fn get_latest(&self, name: &str) -> RegistryResult<ServerRecord> {
        Ok(self.store.get_server_by_name(name).await?)
    }

    /// One specific version of `name`.
    pub async fn get_version(&self, name: &str, version: &str) -> RegistryResult<ServerRecord> {
        Ok(self
            .store
            .get_server_by_name_and_version(name, version)
            .await?)
    }

    /// Every version of `name`, newest first.
    pub async fn list_versions(&self, name: &str) -> RegistryResult<Vec<ServerRecord>> {
        Ok(self.store.get_all_versions_by_server_name(name).await?)
    }

    /// One page of servers matching `filter`.
    ///
    /// `limit` defaults to [`DEFAULT_LIMIT`] and is capped at [`MAX_LIMIT`].
    pub async fn list(
        &self,
        filter: Option<&ServerFilter>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> RegistryResult<Page> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        Ok(self.store.list_servers(filter, cursor, limit).await?)
    }
}

async fn publish_in(tx: &dyn Transaction, server: ServerJson) -> RegistryResult<ServerRecord> {
    tx.acquire_publish_lock(&server.name).await?;

    if tx
        .check_version_exists(&server.name, &server.version)
        .await?
    {
        return Err(RegistryError::VersionExists {
            name: server.name,
            version: server.version,
        });
    }

    tx.unmark_as_latest(&server.name).await?;
    Ok(tx.create_server(server, None).await?)
}
