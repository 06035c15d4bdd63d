//! Durable storage for flushed telemetry batches

use crate::error::SinkError;
use crate::telemetry::event::TelemetryEvent;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};

/// Append-capable storage written by the batch flusher
///
/// A batch is written as `begin` -> `bulk_insert` -> `commit`; the flusher
/// calls `rollback` when the insert fails.
#[async_trait]
pub trait DurableSink: Send + Sync + 'static {
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, SinkError>;

    async fn bulk_insert(
        &self,
        tx: &mut Self::Transaction,
        rows: &[TelemetryEvent],
    ) -> Result<(), SinkError>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), SinkError>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), SinkError>;
}

/// Rows per INSERT statement (18 bound parameters each, stays under the
/// 999-variable limit of older SQLite builds)
const ROWS_PER_STATEMENT: usize = 50;

/// SQLite-backed sink writing into `llm_metrics`
#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    /// Connect and run migrations
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = crate::db::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Use an already migrated pool
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of persisted events
    pub async fn count_events(&self) -> Result<i64, SinkError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM llm_metrics")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Request ids in insertion order
    pub async fn request_ids(&self) -> Result<Vec<String>, SinkError> {
        let ids = sqlx::query_scalar("SELECT request_id FROM llm_metrics ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl DurableSink for SqliteSink {
    type Transaction = Transaction<'static, Sqlite>;

    async fn begin(&self) -> Result<Self::Transaction, SinkError> {
        Ok(self.pool.begin().await?)
    }

    async fn bulk_insert(
        &self,
        tx: &mut Self::Transaction,
        rows: &[TelemetryEvent],
    ) -> Result<(), SinkError> {
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO llm_metrics (
                    timestamp, user_id, user_role, model, input_tokens, output_tokens,
                    latency_ms, ttft_ms, tokens_per_second, cost_usd, status,
                    error_type, error_message, component, cache_hit, trace_id,
                    span_id, request_id
                ) ",
            );

            builder.push_values(chunk, |mut row, event| {
                row.push_bind(event.timestamp)
                    .push_bind(event.user_id.clone())
                    .push_bind(event.user_role.as_str())
                    .push_bind(event.model.clone())
                    .push_bind(i64::from(event.input_tokens))
                    .push_bind(i64::from(event.output_tokens))
                    .push_bind(to_i64(event.latency_ms))
                    .push_bind(event.ttft_ms.map(to_i64))
                    .push_bind(event.tokens_per_second)
                    .push_bind(event.cost_usd.to_string())
                    .push_bind(event.status.as_str())
                    .push_bind(event.error_type.clone())
                    .push_bind(event.error_message.clone())
                    .push_bind(event.component.as_str())
                    .push_bind(event.cache_hit)
                    .push_bind(event.trace_id.clone())
                    .push_bind(event.span_id.clone())
                    .push_bind(event.request_id.clone());
            });

            builder.build().execute(&mut **tx).await?;
        }

        Ok(())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), SinkError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), SinkError> {
        Ok(tx.rollback().await?)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
