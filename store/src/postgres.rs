//! Relational backend on PostgreSQL.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize as _;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tokio::sync::Mutex;

use store_driver::{
    publish_lock_key, Cursor, Driver, Page, Records, RegistryExtensions, ServerFilter,
    ServerJson, ServerRecord, Status, StoreError, StoreErrorKind, Transaction,
};

const ENGINE: &str = "postgres";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS servers (
        id BIGSERIAL UNIQUE,
        server_name TEXT NOT NULL,
        version TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        published_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        is_latest BOOLEAN NOT NULL DEFAULT FALSE,
        value JSONB,
        PRIMARY KEY (server_name, version)
    )"#,
    "CREATE UNIQUE INDEX IF NOT EXISTS servers_one_latest ON servers (server_name) WHERE is_latest",
    "CREATE INDEX IF NOT EXISTS servers_updated_at ON servers (updated_at)",
];

const COLUMNS: &str = "server_name, version, status, published_at, updated_at, is_latest, value";

type Row = (
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    bool,
    Option<serde_json::Value>,
);

/// A listing row, prefixed with its insertion id.
type ListRow = (
    i64,
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    bool,
    Option<serde_json::Value>,
);

fn db(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(database) = &error {
        if database.code().as_deref() == Some("23505") {
            return StoreError::new(ENGINE, StoreErrorKind::AlreadyExists, error);
        }
    }
    StoreError::new(ENGINE, StoreErrorKind::StorageFailure, error)
}

/// Decode a row into a record; `None` for tombstones.
fn decode(row: Row) -> Option<ServerRecord> {
    let (name, version, status, published_at, updated_at, is_latest, value) = row;
    let value = value?;
    let server = match ServerJson::deserialize(&value) {
        Ok(server) => server,
        Err(error) => {
            tracing::warn!(%name, %version, %error, "skipping row with undecodable payload");
            return None;
        }
    };
    Some(ServerRecord {
        server,
        meta: RegistryExtensions {
            status: Status::from(status),
            published_at,
            updated_at,
            is_latest,
        },
    })
}

fn found(row: Option<Row>, name: &str, version: Option<&str>) -> Result<ServerRecord, StoreError> {
    row.and_then(decode)
        .ok_or_else(|| StoreError::not_found(ENGINE, name, version))
}

/// Statements shared by the pool and by open transactions.
mod statements {
    use super::*;

    pub(super) async fn lock(conn: &mut PgConnection, name: &str) -> Result<(), StoreError> {
        // Same bits as the embedded backend's key, reinterpreted as BIGINT.
        let key = publish_lock_key(name) as i64;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(db)?;
        Ok(())
    }

    pub(super) async fn exists(
        conn: &mut PgConnection,
        name: &str,
        version: &str,
    ) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM servers WHERE server_name = $1 AND version = $2)",
        )
        .bind(name)
        .bind(version)
        .fetch_one(&mut *conn)
        .await
        .map_err(db)
    }

    pub(super) async fn unmark(conn: &mut PgConnection, name: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE servers SET is_latest = FALSE WHERE server_name = $1 AND is_latest")
            .bind(name)
            .execute(&mut *conn)
            .await
            .map_err(db)?;
        Ok(())
    }

    pub(super) async fn create(
        conn: &mut PgConnection,
        server: ServerJson,
        meta: Option<RegistryExtensions>,
    ) -> Result<ServerRecord, StoreError> {
        let meta = meta
            .unwrap_or_else(|| RegistryExtensions::published(Utc::now()))
            .normalized();
        let value = serde_json::to_value(&server).map_err(StoreError::with(ENGINE))?;

        if exists(conn, &server.name, &server.version).await? {
            return Err(StoreError::already_exists(
                ENGINE,
                &server.name,
                &server.version,
            ));
        }
        if meta.is_latest {
            unmark(conn, &server.name).await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO servers (server_name, version, status, published_at, updated_at, is_latest, value) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (server_name, version) DO NOTHING",
        )
        .bind(&server.name)
        .bind(&server.version)
        .bind(meta.status.as_str())
        .bind(meta.published_at)
        .bind(meta.updated_at)
        .bind(meta.is_latest)
        .bind(sqlx::types::Json(value))
        .execute(&mut *conn)
        .await
        .map_err(db)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::already_exists(
                ENGINE,
                &server.name,
                &server.version,
            ));
        }
        Ok(ServerRecord { server, meta })
    }

    pub(super) async fn update(
        conn: &mut PgConnection,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> Result<ServerRecord, StoreError> {
        let value = serde_json::to_value(&server).map_err(StoreError::with(ENGINE))?;
        let row: Option<Row> = sqlx::query_as(&format!(
            "UPDATE servers SET value = $3, updated_at = GREATEST(updated_at, $4) \
             WHERE server_name = $1 AND version = $2 RETURNING {COLUMNS}"
        ))
        .bind(name)
        .bind(version)
        .bind(sqlx::types::Json(value))
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;

        let (_, _, status, published_at, updated_at, is_latest, _) =
            row.ok_or_else(|| StoreError::not_found(ENGINE, name, Some(version)))?;
        Ok(ServerRecord {
            server,
            meta: RegistryExtensions {
                status: Status::from(status),
                published_at,
                updated_at,
                is_latest,
            },
        })
    }

    pub(super) async fn set_status(
        conn: &mut PgConnection,
        name: &str,
        version: &str,
        status: Status,
    ) -> Result<ServerRecord, StoreError> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "UPDATE servers SET status = $3, updated_at = GREATEST(updated_at, $4) \
             WHERE server_name = $1 AND version = $2 RETURNING {COLUMNS}"
        ))
        .bind(name)
        .bind(version)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
        found(row, name, Some(version))
    }

    /// Rows after `after` that match `filter`, in insertion order, at most
    /// `batch` of them.
    fn list_query(
        filter: Option<&ServerFilter>,
        after: i64,
        batch: usize,
    ) -> QueryBuilder<'static, Postgres> {
        let mut query: QueryBuilder<'static, Postgres> = QueryBuilder::new(format!(
            "SELECT id, {COLUMNS} FROM servers WHERE value IS NOT NULL AND id > "
        ));
        query.push_bind(after);

        if let Some(filter) = filter {
            if let Some(name) = &filter.name {
                query.push(" AND server_name = ").push_bind(name.clone());
            }
            if let Some(version) = &filter.version {
                query.push(" AND version = ").push_bind(version.clone());
            }
            if let Some(is_latest) = filter.is_latest {
                query.push(" AND is_latest = ").push_bind(is_latest);
            }
            if let Some(needle) = &filter.substring_name {
                query
                    .push(" AND strpos(lower(server_name), lower(")
                    .push_bind(needle.clone())
                    .push(")) > 0");
            }
            if let Some(since) = filter.updated_since {
                query.push(" AND updated_at > ").push_bind(since);
            }
            if let Some(url) = &filter.remote_url {
                query
                    .push(" AND value->'remotes' @> ")
                    .push_bind(sqlx::types::Json(serde_json::json!([{ "url": url }])));
            }
        }

        query
            .push(" ORDER BY id LIMIT ")
            .push_bind(i64::try_from(batch).unwrap_or(i64::MAX));
        query
    }

    /// One page of decodable records.
    ///
    /// Rows whose payload does not decode are skipped without counting
    /// toward `limit`; batches are fetched until `limit + 1` records are
    /// found or the table runs out.
    pub(super) async fn list(
        conn: &mut PgConnection,
        filter: Option<&ServerFilter>,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        if limit == 0 {
            return Ok(Page::default());
        }

        // An unknown cursor resolves to 0 and restarts the scan.
        let mut after = match cursor {
            Some(cursor) => sqlx::query_scalar::<_, i64>(
                "SELECT id FROM servers WHERE server_name = $1 AND version = $2",
            )
            .bind(&cursor.name)
            .bind(&cursor.version)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?
            .unwrap_or(0),
            None => 0,
        };

        let batch = limit.saturating_add(1);
        let mut servers = Vec::with_capacity(limit);
        let mut more = false;

        'scan: loop {
            let mut query = list_query(filter, after, batch);
            let rows: Vec<ListRow> = query
                .build_query_as()
                .fetch_all(&mut *conn)
                .await
                .map_err(db)?;
            let exhausted = rows.len() < batch;

            for (id, name, version, status, published_at, updated_at, is_latest, value) in rows {
                after = id;
                let Some(record) =
                    decode((name, version, status, published_at, updated_at, is_latest, value))
                else {
                    continue;
                };
                if servers.len() == limit {
                    more = true;
                    break 'scan;
                }
                servers.push(record);
            }

            if exhausted {
                break;
            }
        }

        let next = if more {
            servers
                .last()
                .map(|record: &ServerRecord| Cursor::new(record.name(), record.version()))
        } else {
            None
        };

        Ok(Page { servers, next })
    }

    pub(super) async fn latest(
        conn: &mut PgConnection,
        name: &str,
    ) -> Result<ServerRecord, StoreError> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM servers WHERE server_name = $1 AND is_latest LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
        found(row, name, None)
    }

    pub(super) async fn version(
        conn: &mut PgConnection,
        name: &str,
        version: &str,
    ) -> Result<ServerRecord, StoreError> {
        let row: Option<Row> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM servers WHERE server_name = $1 AND version = $2"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
        found(row, name, Some(version))
    }

    pub(super) async fn versions(
        conn: &mut PgConnection,
        name: &str,
    ) -> Result<Vec<ServerRecord>, StoreError> {
        let rows: Vec<Row> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM servers WHERE server_name = $1 ORDER BY published_at DESC, id DESC"
        ))
        .bind(name)
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;

        let versions: Vec<_> = rows.into_iter().filter_map(decode).collect();
        if versions.is_empty() {
            return Err(StoreError::not_found(ENGINE, name, None));
        }
        Ok(versions)
    }

    pub(super) async fn count(conn: &mut PgConnection, name: &str) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM servers WHERE server_name = $1")
            .bind(name)
            .fetch_one(&mut *conn)
            .await
            .map_err(db)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

/// Registry store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to `url` and make sure the schema exists.
    #[tracing::instrument(skip(url))]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(|error| {
                let kind = match error {
                    sqlx::Error::Configuration(_) => StoreErrorKind::Configuration,
                    _ => StoreErrorKind::StorageFailure,
                };
                StoreError::builder(ENGINE, kind, error)
                    .context("connect")
                    .build()
            })?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not checked.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        }
        tracing::debug!("schema is up to date");
        Ok(())
    }

    async fn conn(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool.acquire().await.map_err(db)
    }
}

#[async_trait::async_trait]
impl Records for PostgresStore {
    async fn create_server(
        &self,
        server: ServerJson,
        meta: Option<RegistryExtensions>,
    ) -> Result<ServerRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        statements::lock(&mut tx, &server.name).await?;
        let record = statements::create(&mut tx, server, meta).await?;
        tx.commit().await.map_err(db)?;
        Ok(record)
    }

    async fn update_server(
        &self,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> Result<ServerRecord, StoreError> {
        statements::update(&mut *self.conn().await?, name, version, server).await
    }

    async fn set_server_status(
        &self,
        name: &str,
        version: &str,
        status: Status,
    ) -> Result<ServerRecord, StoreError> {
        statements::set_status(&mut *self.conn().await?, name, version, status).await
    }

    async fn unmark_as_latest(&self, name: &str) -> Result<(), StoreError> {
        statements::unmark(&mut *self.conn().await?, name).await
    }

    async fn list_servers(
        &self,
        filter: Option<&ServerFilter>,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        statements::list(&mut *self.conn().await?, filter, cursor, limit).await
    }

    async fn get_server_by_name(&self, name: &str) -> Result<ServerRecord, StoreError> {
        statements::latest(&mut *self.conn().await?, name).await
    }

    async fn get_server_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ServerRecord, StoreError> {
        statements::version(&mut *self.conn().await?, name, version).await
    }

    async fn get_all_versions_by_server_name(
        &self,
        name: &str,
    ) -> Result<Vec<ServerRecord>, StoreError> {
        statements::versions(&mut *self.conn().await?, name).await
    }

    async fn count_server_versions(&self, name: &str) -> Result<usize, StoreError> {
        statements::count(&mut *self.conn().await?, name).await
    }

    async fn check_version_exists(&self, name: &str, version: &str) -> Result<bool, StoreError> {
        statements::exists(&mut *self.conn().await?, name, version).await
    }
}

#[async_trait::async_trait]
impl Driver for PostgresStore {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(db)?;
        Ok(Box::new(PostgresTransaction { tx: Mutex::new(tx) }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

/// A database transaction. Dropping it without committing rolls back.
pub struct PostgresTransaction {
    tx: Mutex<sqlx::Transaction<'static, Postgres>>,
}

impl fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTransaction").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Records for PostgresTransaction {
    async fn create_server(
        &self,
        server: ServerJson,
        meta: Option<RegistryExtensions>,
    ) -> Result<ServerRecord, StoreError> {
        statements::create(&mut **self.tx.lock().await, server, meta).await
    }

    async fn update_server(
        &self,
        name: &str,
        version: &str,
        server: ServerJson,
    ) -> Result<ServerRecord, StoreError> {
        statements::update(&mut **self.tx.lock().await, name, version, server).await
    }

    async fn set_server_status(
        &self,
        name: &str,
        version: &str,
        status: Status,
    ) -> Result<ServerRecord, StoreError> {
        statements::set_status(&mut **self.tx.lock().await, name, version, status).await
    }

    async fn unmark_as_latest(&self, name: &str) -> Result<(), StoreError> {
        statements::unmark(&mut **self.tx.lock().await, name).await
    }

    async fn list_servers(
        &self,
        filter: Option<&ServerFilter>,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        statements::list(&mut **self.tx.lock().await, filter, cursor, limit).await
    }

    async fn get_server_by_name(&self, name: &str) -> Result<ServerRecord, StoreError> {
        statements::latest(&mut **self.tx.lock().await, name).await
    }

    async fn get_server_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<ServerRecord, StoreError> {
        statements::version(&mut **self.tx.lock().await, name, version).await
    }

    async fn get_all_versions_by_server_name(
        &self,
        name: &str,
    ) -> Result<Vec<ServerRecord>, StoreError> {
        statements::versions(&mut **self.tx.lock().await, name).await
    }

    async fn count_server_versions(&self, name: &str) -> Result<usize, StoreError> {
        statements::count(&mut **self.tx.lock().await, name).await
    }

    async fn check_version_exists(&self, name: &str, version: &str) -> Result<bool, StoreError> {
        statements::exists(&mut **self.tx.lock().await, name, version).await
    }
}

#[async_trait::async_trait]
impl Transaction for PostgresTransaction {
    async fn acquire_publish_lock(&self, name: &str) -> Result<(), StoreError> {
        // Advisory locks are re-entrant within a session.
        statements::lock(&mut **self.tx.lock().await, name).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.into_inner().commit().await.map_err(db)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        this.tx.into_inner().rollback().await.map_err(db)
    }
}
