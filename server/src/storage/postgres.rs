//! PostgreSQL storage adapter.
//!
//! Best-effort persistence: every method maps database failures into
//! [`SyncError::Storage`] and the caller logs and moves on — the
//! in-memory stores stay authoritative. JSON columns are stored as
//! text; clock comparisons happen in process because vector-clock
//! partial order does not translate to SQL.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use super::Storage;
use crate::clock::VectorClock;
use crate::document::StoredDelta;
use crate::error::SyncError;

/// Upper bound on replayed deltas per sync; beyond this a late
/// subscriber gets the snapshot anyway.
const DELTA_FETCH_LIMIT: i64 = 1000;

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.ensure_schema().await?;
        info!("postgres storage connected");
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), SyncError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_documents (
                 id TEXT PRIMARY KEY,
                 state TEXT NOT NULL,
                 vector_clock TEXT NOT NULL,
                 updated_at BIGINT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_deltas (
                 seq BIGSERIAL PRIMARY KEY,
                 document_id TEXT NOT NULL,
                 delta_id TEXT NOT NULL,
                 client_id TEXT NOT NULL,
                 ts BIGINT NOT NULL,
                 fields TEXT NOT NULL,
                 vector_clock TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sync_deltas_document_idx
             ON sync_deltas (document_id, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn save_document(
        &self,
        document_id: &str,
        state: &serde_json::Map<String, Value>,
    ) -> Result<(), SyncError> {
        let state_json = serde_json::to_string(state).map_err(internal_err)?;
        sqlx::query(
            "INSERT INTO sync_documents (id, state, vector_clock, updated_at)
             VALUES ($1, $2, '{}', $3)
             ON CONFLICT (id) DO UPDATE
             SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at",
        )
        .bind(document_id)
        .bind(state_json)
        .bind(crate::util::now_ms())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        value: u64,
    ) -> Result<(), SyncError> {
        // Read-merge-write; the per-document lock in the caller already
        // serializes writers within this instance.
        let current: Option<String> =
            sqlx::query_scalar("SELECT vector_clock FROM sync_documents WHERE id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;

        let mut clock: VectorClock = match current {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => VectorClock::new(),
        };
        clock.merge(&VectorClock::from([(client_id, value)]));
        let clock_json = serde_json::to_string(&clock).map_err(internal_err)?;

        sqlx::query(
            "INSERT INTO sync_documents (id, state, vector_clock, updated_at)
             VALUES ($1, '{}', $2, $3)
             ON CONFLICT (id) DO UPDATE
             SET vector_clock = EXCLUDED.vector_clock, updated_at = EXCLUDED.updated_at",
        )
        .bind(document_id)
        .bind(clock_json)
        .bind(crate::util::now_ms())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn save_delta(&self, document_id: &str, delta: &StoredDelta) -> Result<(), SyncError> {
        let fields_json = serde_json::to_string(&delta.fields).map_err(internal_err)?;
        let clock_json = serde_json::to_string(&delta.vector_clock).map_err(internal_err)?;
        sqlx::query(
            "INSERT INTO sync_deltas
                 (document_id, delta_id, client_id, ts, fields, vector_clock)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(document_id)
        .bind(&delta.id)
        .bind(&delta.client_id)
        .bind(delta.timestamp)
        .bind(fields_json)
        .bind(clock_json)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<(serde_json::Map<String, Value>, VectorClock)>, SyncError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT state, vector_clock FROM sync_documents WHERE id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;

        match row {
            Some((state_raw, clock_raw)) => {
                let state = serde_json::from_str(&state_raw).map_err(internal_err)?;
                let clock = serde_json::from_str(&clock_raw).map_err(internal_err)?;
                Ok(Some((state, clock)))
            }
            None => Ok(None),
        }
    }

    async fn get_deltas_since(
        &self,
        document_id: &str,
        since: &VectorClock,
    ) -> Result<Vec<StoredDelta>, SyncError> {
        let rows: Vec<(String, String, i64, String, String)> = sqlx::query_as(
            "SELECT delta_id, client_id, ts, fields, vector_clock
             FROM sync_deltas WHERE document_id = $1
             ORDER BY seq ASC LIMIT $2",
        )
        .bind(document_id)
        .bind(DELTA_FETCH_LIMIT)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut deltas = Vec::with_capacity(rows.len());
        for (delta_id, client_id, ts, fields_raw, clock_raw) in rows {
            let fields = serde_json::from_str(&fields_raw).map_err(internal_err)?;
            let vector_clock: VectorClock =
                serde_json::from_str(&clock_raw).map_err(internal_err)?;
            if vector_clock == *since || vector_clock.happens_before(since) {
                continue;
            }
            deltas.push(StoredDelta {
                id: delta_id,
                client_id,
                timestamp: ts,
                fields,
                vector_clock,
            });
        }
        Ok(deltas)
    }

    async fn disconnect(&self) -> Result<(), SyncError> {
        self.pool.close().await;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

fn storage_err(e: sqlx::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

fn internal_err(e: serde_json::Error) -> SyncError {
    SyncError::Storage(format!("serialization: {e}"))
}
