//! Postgres-backed stats store.
//!
//! Each tenant document is one JSONB row. Field changes are applied with a
//! server-side path setter inside a single transaction, so a batch of field
//! writes is atomic and never replaces fields it did not touch. Each change's
//! [`FieldOp`](warlog_stats::FieldOp) is resolved in SQL against the row as
//! locked by the upsert, so writers in other processes cannot lower a maximum
//! or unstick a value.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | `Decode`, `ColumnDecode` | `Corrupt` |
//! | anything else (IO, TLS, pool timeout, database errors) | `Unavailable` |
//!
//! `Unavailable` is the only retryable store failure.

use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{Span, info, instrument};

use warlog_core::TenantKey;
use warlog_stats::{FieldChange, FieldPath, TenantStats};

use super::{StatsStore, StoreError, decode};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS warlog_stats (
    key        TEXT PRIMARY KEY,
    doc        JSONB NOT NULL DEFAULT '{}'::jsonb,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

// `jsonb_set` does not create missing intermediate objects; this does.
const CREATE_SET_PATH: &str = r#"
CREATE OR REPLACE FUNCTION warlog_set_path(doc jsonb, path text[], value jsonb)
RETURNS jsonb
LANGUAGE plpgsql
IMMUTABLE
AS $$
DECLARE
    head text;
BEGIN
    IF coalesce(array_length(path, 1), 0) = 0 THEN
        RETURN value;
    END IF;
    IF doc IS NULL OR jsonb_typeof(doc) <> 'object' THEN
        doc := '{}'::jsonb;
    END IF;
    head := path[1];
    RETURN jsonb_set(doc, ARRAY[head], warlog_set_path(doc -> head, path[2:], value), true);
END;
$$
"#;

// Mirrors `FieldChange::resolve`; returns `stored` when it wins.
const CREATE_MERGE_VALUE: &str = r#"
CREATE OR REPLACE FUNCTION warlog_merge_value(stored jsonb, incoming jsonb, op text, sentinel jsonb)
RETURNS jsonb
LANGUAGE sql
IMMUTABLE
AS $$
SELECT CASE
    WHEN stored IS NULL OR jsonb_typeof(stored) = 'null' THEN incoming
    WHEN op = 'set' THEN incoming
    WHEN op = 'max' THEN
        CASE
            WHEN jsonb_typeof(stored) = 'number' AND jsonb_typeof(incoming) = 'number'
                 AND (stored #>> '{}')::numeric >= (incoming #>> '{}')::numeric THEN stored
            ELSE incoming
        END
    WHEN op = 'fill' AND stored = sentinel AND incoming <> sentinel THEN incoming
    ELSE stored
END
$$
"#;

const UPSERT_FIELD: &str = r#"
INSERT INTO warlog_stats (key, doc, updated_at)
VALUES ($1, warlog_set_path('{}'::jsonb, $2::text[], $3::jsonb), NOW())
ON CONFLICT (key)
DO UPDATE SET
    doc = warlog_set_path(
        warlog_stats.doc,
        $2::text[],
        warlog_merge_value(warlog_stats.doc #> $2::text[], $3::jsonb, $4, $5::jsonb)
    ),
    updated_at = NOW()
"#;

/// Stats documents in the `warlog_stats` table.
#[derive(Debug, Clone)]
pub struct PostgresStatsStore {
    pool: PgPool,
}

impl PostgresStatsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to create Postgres pool for stats store")?;
        Ok(Self::new(pool))
    }

    /// Create the table and the path setter if they do not exist.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .context("failed to create warlog_stats table")?;
        sqlx::query(CREATE_SET_PATH)
            .execute(&self.pool)
            .await
            .context("failed to create warlog_set_path function")?;
        sqlx::query(CREATE_MERGE_VALUE)
            .execute(&self.pool)
            .await
            .context("failed to create warlog_merge_value function")?;
        info!("stats store schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl StatsStore for PostgresStatsStore {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn find(&self, key: &TenantKey) -> Result<Option<TenantStats>, StoreError> {
        let row = sqlx::query("SELECT doc FROM warlog_stats WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find", e))?;

        match row {
            Some(row) => {
                let doc: Value = row.try_get("doc").map_err(|e| map_sqlx_error("find", e))?;
                decode(key, doc).map(Some)
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, changes), fields(key = %key, change_count = changes.len()), err)]
    async fn apply(&self, key: &TenantKey, changes: &[FieldChange]) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for change in changes {
            let sentinel = change.op.sentinel().map_or(Value::Null, Value::from);
            sqlx::query(UPSERT_FIELD)
                .bind(key.as_str())
                .bind(change.path.segments().to_vec())
                .bind(change.value.clone())
                .bind(change.op.as_str())
                .bind(sentinel)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("apply", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key, path = %path), err)]
    async fn unset(&self, key: &TenantKey, path: &FieldPath) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE warlog_stats
            SET doc = doc #- $2::text[], updated_at = NOW()
            WHERE key = $1 AND doc #> $2::text[] IS NOT NULL
            "#,
        )
        .bind(key.as_str())
        .bind(path.segments().to_vec())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("unset", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn delete(&self, key: &TenantKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM warlog_stats WHERE key = $1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(removed = tracing::field::Empty), err)]
    async fn drop_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM warlog_stats")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("drop_all", e))?;

        let removed = result.rows_affected();
        Span::current().record("removed", removed);
        Ok(removed)
    }

    #[instrument(skip(self), err)]
    async fn keys(&self) -> Result<Vec<TenantKey>, StoreError> {
        let rows = sqlx::query("SELECT key FROM warlog_stats ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("keys", e))?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("key").map_err(|e| map_sqlx_error("keys", e))?;
                TenantKey::parse(raw.clone()).map_err(|e| StoreError::Corrupt {
                    key: raw,
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

/// Map SQLx errors to [`StoreError`].
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Corrupt {
            key: String::new(),
            reason: format!("decode error in {operation}: {err}"),
        },
        sqlx::Error::Database(db_err) => {
            StoreError::unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::unavailable(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::unavailable(format!("sqlx error in {operation}: {err}")),
    }
}
