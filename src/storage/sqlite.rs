//! SQLite blob store.

use async_trait::async_trait;
use bytes::Bytes;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use super::schema::{Blobs, CREATE_BLOBS_TABLE};
use super::{BlobStore, Result};

/// SQLite implementation of BlobStore.
pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    /// Create a new SQLite blob store over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path` and initialize the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_BLOBS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let query = Query::select()
            .column(Blobs::Name)
            .from(Blobs::Table)
            .and_where(Expr::col(Blobs::Name).like(format!("{}%", prefix)))
            .order_by(Blobs::Name, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        // LIKE treats `_` as a wildcard; keep only true prefix matches.
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn get(&self, name: &str) -> Result<Option<Bytes>> {
        let query = Query::select()
            .column(Blobs::Data)
            .from(Blobs::Table)
            .and_where(Expr::col(Blobs::Name).eq(name))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        Ok(row.map(|row| Bytes::from(row.get::<Vec<u8>, _>("data"))))
    }

    async fn put_if_absent(&self, name: &str, data: Bytes) -> Result<bool> {
        let created_at = chrono::Utc::now().to_rfc3339();

        let query = Query::insert()
            .into_table(Blobs::Table)
            .columns([Blobs::Name, Blobs::Data, Blobs::CreatedAt])
            .values_panic([name.into(), data.to_vec().into(), created_at.into()])
            .on_conflict(OnConflict::column(Blobs::Name).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }
}
