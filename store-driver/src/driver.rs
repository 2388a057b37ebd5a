use std::{fmt, future::Future, ops::Deref, pin::Pin, sync::Arc};

use crate::error::StoreError;
use crate::filter::{Cursor, ServerFilter};
use crate::record::{RegistryExtensions, ServerJson, ServerRecord, Status};

/// A boxed, sendable future borrowing for `'f`.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

/// Stable 64-bit key for the per-namespace publish lock.
///
/// FNV-1a over the UTF-8 bytes of the server name. Every backend derives its
/// lock from this value so publishes serialize identically regardless of the
/// store in use.
pub fn publish_lock_key(name: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    name.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Matching records, in insertion order.
    pub servers: Vec<ServerRecord>,

    /// Resume position for the next page, `None` once all matches were returned.
    pub next: Option<Cursor>,
}

/// Record operations common to backends and their transactions.
#[async_trait::async_trait]
pub trait Records: fmt::Debug + Send + Sync {
    /// Insert a new server version.
    ///
    /// Without `meta` the version is published active and latest at the current
    /// time. When the new record is latest, any other latest version of the same
    /// name is unmarked as part of the same write.
    async fn create_server(
        &self,
        server: ServerJson,
        meta: Option<RegistryExtensions>,
    ) -> Result<ServerRecord, StoreError>;

    /// Replace the payload of an existing version.
    async fn update_server(
        &self,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> Result<ServerRecord, StoreError>;

    /// Change the status of an existing version and bump `updated_at`.
    async fn set_server_status(
        &self,
        name: &str,
        version: &str,
        status: Status,
    ) -> Result<ServerRecord, StoreError>;

    /// Clear the latest flag on every version of `name`.
    async fn unmark_as_latest(&self, name: &str) -> Result<(), StoreError>;

    /// Up to `limit` records matching `filter`, resuming after `cursor`.
    async fn list_servers(
        &self,
        filter: Option<&ServerFilter>,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError>;

    /// The current latest version of `name`.
    async fn get_server_by_name(&self, name: &str) -> Result<ServerRecord, StoreError>;

    /// One specific version of `name`.
    async fn get_server_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ServerRecord, StoreError>;

    /// Every version of `name`, most recently published first.
    async fn get_all_versions_by_server_name(
        &self,
        name: &str,
    ) -> Result<Vec<ServerRecord>, StoreError>;

    /// Number of versions stored for `name`.
    async fn count_server_versions(&self, name: &str) -> Result<usize, StoreError>;

    /// Whether `name@version` is stored.
    async fn check_version_exists(&self, name: &str, version: &str) -> Result<bool, StoreError>;
}

/// A logical unit of work handed to `in_transaction` callbacks.
///
/// Relational backends commit or roll back atomically. The embedded file
/// backend only scopes publish locks: writes are persisted as they happen.
#[async_trait::async_trait]
pub trait Transaction: Records {
    /// Block until the namespace lock for `name` is held by this transaction.
    ///
    /// The lock is released when the transaction completes. Acquiring a name
    /// already held by this transaction returns immediately.
    async fn acquire_publish_lock(&self, name: &str) -> Result<(), StoreError>;

    /// Make the transaction's writes durable and release its locks.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Abandon the transaction and release its locks.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// A storage backend.
#[async_trait::async_trait]
pub trait Driver: Records {
    /// The name of the backend.
    fn name(&self) -> &'static str;

    /// Start a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Flush and release backend resources.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<D> Records for Arc<D>
where
    D: ?Sized + Records + 'static,
{
    async fn create_server(
        &self,
        server: ServerJson,
        meta: Option<RegistryExtensions>,
    ) -> Result<ServerRecord, StoreError> {
        self.deref().create_server(server, meta).await
    }

    async fn update_server(
        &self,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> Result<ServerRecord, StoreError> {
        self.deref().update_server(name, version, server).await
    }

    async fn set_server_status(
        &self,
        name: &str,
        version: &str,
        status: Status,
    ) -> Result<ServerRecord, StoreError> {
        self.deref().set_server_status(name, version, status).await
    }

    async fn unmark_as_latest(&self, name: &str) -> Result<(), StoreError> {
        self.deref().unmark_as_latest(name).await
    }

    async fn list_servers(
        &self,
        filter: Option<&ServerFilter>,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        self.deref().list_servers(filter, cursor, limit).await
    }

    async fn get_server_by_name(&self, name: &str) -> Result<ServerRecord, StoreError> {
        self.deref().get_server_by_name(name).await
    }

    async fn get_server_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ServerRecord, StoreError> {
        self.deref().get_server_by_name_and_version(name, version).await
    }

    async fn get_all_versions_by_server_name(
        &self,
        name: &str,
    ) -> Result<Vec<ServerRecord>, StoreError> {
        self.deref().get_all_versions_by_server_name(name).await
    }

    async fn count_server_versions(&self, name: &str) -> Result<usize, StoreError> {
        self.deref().count_server_versions(name).await
    }

    async fn check_version_exists(&self, name: &str, version: &str) -> Result<bool, StoreError> {
        self.deref().check_version_exists(name, version).await
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        self.deref().begin().await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.deref().close().await
    }
}
