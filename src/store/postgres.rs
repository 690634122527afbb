//! pgvector-backed store. Every operation opens its own connection.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use tokio_postgres::{Client, NoTls};

use super::{
    ivf_worth_building, validate_vector, ContentId, EmbeddingRecord, ScoredRecord, StoreError,
    VectorStore,
};
use crate::semantic::{truncate_chars, STORED_SNIPPET_CHARS};

const TABLE: &str = "post_embeddings";
const EMBEDDING_INDEX: &str = "idx_post_embeddings_embedding";

/// Connection parameters for the store database.
#[derive(Clone)]
pub struct PgParams {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl Debug for PgParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PgParams {{ host: {:?}, port: {}, dbname: {:?}, user: {:?}, password: [REDACTED], connect_timeout: {:?} }}",
            self.host, self.port, self.dbname, self.user, self.connect_timeout
        )
    }
}

pub struct PgVectorStore {
    params: PgParams,
    dimensions: usize,
    ivf_lists: usize,
    ivf_probes: usize,
}

impl PgVectorStore {
    pub fn new(params: PgParams, dimensions: usize, ivf_lists: usize, ivf_probes: usize) -> Self {
        Self {
            params,
            dimensions,
            ivf_lists,
            ivf_probes,
        }
    }

    async fn connect(&self) -> Result<Client, StoreError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.params.host)
            .port(self.params.port)
            .dbname(&self.params.dbname)
            .user(&self.params.user)
            .password(&self.params.password)
            .connect_timeout(self.params.connect_timeout);

        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                log::error!("postgres connection error: {err}");
            }
        });
        Ok(client)
    }

    /// Dimension of an existing `embedding` column, if the table exists.
    async fn existing_dimensions(&self, client: &Client) -> Result<Option<usize>, StoreError> {
        let row = client
            .query_opt(
                "SELECT a.atttypmod FROM pg_attribute a \
                 JOIN pg_class c ON c.oid = a.attrelid \
                 WHERE c.relname = $1 AND a.attname = 'embedding' AND NOT a.attisdropped",
                &[&TABLE],
            )
            .await?;

        Ok(row
            .map(|row| row.get::<_, i32>(0))
            .filter(|typmod| *typmod > 0)
            .map(|typmod| typmod as usize))
    }

    async fn index_exists(&self, client: &Client) -> Result<bool, StoreError> {
        let row = client
            .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&EMBEDDING_INDEX])
            .await?;
        Ok(row.get(0))
    }

    async fn row_count(&self, client: &Client) -> Result<u64, StoreError> {
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {TABLE}"), &[])
            .await?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    /// Bring the ivfflat index in line with `plan_index`.
    async fn sync_index(&self, client: &Client, rebuild: bool) -> Result<(), StoreError> {
        let exists = self.index_exists(client).await?;
        let rows = self.row_count(client).await?;

        match plan_index(exists, rows, self.ivf_lists, rebuild) {
            IndexPlan::Keep => {}
            IndexPlan::Create => {
                client
                    .batch_execute(&create_index_sql(self.ivf_lists))
                    .await?;
                log::info!("Created {} over {} rows", EMBEDDING_INDEX, rows);
            }
            IndexPlan::Rebuild => {
                client
                    .batch_execute(&format!("REINDEX INDEX {EMBEDDING_INDEX}"))
                    .await?;
                log::info!("Rebuilt {} over {} rows", EMBEDDING_INDEX, rows);
            }
            IndexPlan::Defer => {
                log::info!(
                    "{} rows is too few for {} ivfflat lists, searching with exact scans",
                    rows,
                    self.ivf_lists
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexPlan {
    Keep,
    Create,
    Rebuild,
    Defer,
}

/// Startup builds the index only once the table can fill every list. An
/// explicit rebuild builds over whatever rows exist.
fn plan_index(exists: bool, rows: u64, lists: usize, rebuild: bool) -> IndexPlan {
    let rows = usize::try_from(rows).unwrap_or(usize::MAX);
    match (exists, rebuild) {
        (true, false) => IndexPlan::Keep,
        (true, true) => IndexPlan::Rebuild,
        (false, false) if ivf_worth_building(rows, lists) => IndexPlan::Create,
        (false, true) if rows > 0 => IndexPlan::Create,
        (false, _) => IndexPlan::Defer,
    }
}

fn create_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {TABLE} (
            id BIGSERIAL PRIMARY KEY,
            post_id BIGINT NOT NULL UNIQUE,
            title TEXT,
            content_snippet TEXT,
            embedding VECTOR({dimensions}) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"
    )
}

fn create_index_sql(lists: usize) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {EMBEDDING_INDEX} ON {TABLE} \
         USING ivfflat (embedding vector_cosine_ops) WITH (lists = {lists})"
    )
}

fn upsert_sql() -> String {
    format!(
        "INSERT INTO {TABLE} (post_id, title, content_snippet, embedding) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (post_id) DO UPDATE SET \
            title = EXCLUDED.title, \
            content_snippet = EXCLUDED.content_snippet, \
            embedding = EXCLUDED.embedding, \
            updated_at = NOW()"
    )
}

fn search_sql() -> String {
    format!(
        "SELECT post_id, COALESCE(title, ''), COALESCE(content_snippet, ''), \
            (1 - (embedding <=> $1))::float8 AS score \
         FROM {TABLE} \
         WHERE $2::int8 IS NULL OR post_id <> $2 \
         ORDER BY embedding <=> $1 \
         LIMIT $3"
    )
}

fn as_i64(limit: usize) -> Result<i64, StoreError> {
    i64::try_from(limit)
        .map_err(|_| StoreError::Unavailable(format!("limit {} exceeds i64 range", limit)))
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn init(&self) -> Result<(), StoreError> {
        let client = self.connect().await?;

        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await?;
        client
            .batch_execute(&create_table_sql(self.dimensions))
            .await?;
        client
            .batch_execute(&format!(
                "ALTER TABLE {TABLE} ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()"
            ))
            .await?;

        if let Some(existing) = self.existing_dimensions(&client).await? {
            if existing != self.dimensions {
                return Err(StoreError::DimensionMismatch {
                    expected: self.dimensions,
                    got: existing,
                });
            }
        }

        self.sync_index(&client, false).await?;

        log::info!(
            "pgvector schema ready on {}:{}/{} ({} dimensions)",
            self.params.host,
            self.params.port,
            self.params.dbname,
            self.dimensions
        );
        Ok(())
    }

    async fn upsert(
        &self,
        content_id: ContentId,
        title: &str,
        snippet: &str,
        vector: Vec<f32>,
    ) -> Result<(), StoreError> {
        validate_vector(&vector, self.dimensions)?;

        let snippet = truncate_chars(snippet, STORED_SNIPPET_CHARS);
        let vector = Vector::from(vector);
        let client = self.connect().await?;
        client
            .execute(
                &upsert_sql(),
                &[&content_id.get(), &title, &snippet, &vector],
            )
            .await?;
        Ok(())
    }

    async fn get_vector(&self, content_id: ContentId) -> Result<Option<Vec<f32>>, StoreError> {
        let client = self.connect().await?;
        let row = client
            .query_opt(
                &format!("SELECT embedding FROM {TABLE} WHERE post_id = $1"),
                &[&content_id.get()],
            )
            .await?;
        Ok(row.map(|row| row.get::<_, Vector>(0).to_vec()))
    }

    async fn get_record(
        &self,
        content_id: ContentId,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let client = self.connect().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT COALESCE(title, ''), COALESCE(content_snippet, ''), embedding, created_at, updated_at \
                     FROM {TABLE} WHERE post_id = $1"
                ),
                &[&content_id.get()],
            )
            .await?;

        Ok(row.map(|row| EmbeddingRecord {
            content_id,
            title: row.get(0),
            snippet: row.get(1),
            embedding: row.get::<_, Vector>(2).to_vec(),
            created_at: row.get::<_, DateTime<Utc>>(3),
            updated_at: row.get::<_, DateTime<Utc>>(4),
        }))
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        exclude: Option<ContentId>,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        validate_vector(query, self.dimensions)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let client = self.connect().await?;
        client
            .batch_execute(&format!("SET ivfflat.probes = {}", self.ivf_probes))
            .await?;

        let vector = Vector::from(query.to_vec());
        let exclude = exclude.map(ContentId::get);
        let limit = as_i64(limit)?;
        let rows = client
            .query(&search_sql(), &[&vector, &exclude, &limit])
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ScoredRecord {
                content_id: ContentId::new(row.get(0)),
                title: row.get(1),
                snippet: row.get(2),
                score: row.get(3),
            })
            .collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let client = self.connect().await?;
        self.row_count(&client).await
    }

    async fn reindex(&self) -> Result<(), StoreError> {
        let client = self.connect().await?;
        self.sync_index(&client, true).await
    }
}
