//! PostgreSQL implementation of QueueSource
//!
//! Production-ready queue storage using PostgreSQL with:
//! - Atomic pop via `DELETE ... RETURNING`
//! - `SKIP LOCKED` so concurrent listeners never receive the same payload
//! - FIFO per key by insertion sequence

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{error, instrument, trace};

use super::queue::{QueueError, QueueSource};

/// How often `pop_wait` re-checks an empty queue before its deadline
pub const DEFAULT_REPOLL_INTERVAL: Duration = Duration::from_millis(100);

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS drainq_queue_items (
        id          BIGSERIAL PRIMARY KEY,
        queue_key   TEXT        NOT NULL,
        payload     BYTEA       NOT NULL,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

const CREATE_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS drainq_queue_items_key_id
        ON drainq_queue_items (queue_key, id)
"#;

/// PostgreSQL implementation of QueueSource
///
/// # Example
///
/// ```ignore
/// use drainq::PostgresQueueSource;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let source = PostgresQueueSource::new(pool);
/// source.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueueSource {
    pool: PgPool,
    repoll_interval: Duration,
}

impl PostgresQueueSource {
    /// Create a new PostgreSQL source with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            repoll_interval: DEFAULT_REPOLL_INTERVAL,
        }
    }

    /// Set how often an empty queue is re-checked while waiting
    pub fn with_repoll_interval(mut self, interval: Duration) -> Self {
        self.repoll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue table and index if they don't exist
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        for statement in [CREATE_TABLE, CREATE_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    /// Number of payloads waiting under `key`
    pub async fn len(&self, key: &str) -> Result<usize, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM drainq_queue_items WHERE queue_key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let count: i64 = row.get("n");
        Ok(count as usize)
    }

    async fn try_pop(&self, key: &str) -> Result<Option<Vec<u8>>, QueueError> {
        let row = sqlx::query(
            r#"
            DELETE FROM drainq_queue_items
            WHERE id = (
                SELECT id
                FROM drainq_queue_items
                WHERE queue_key = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to pop queue item: {}", e);
            map_sqlx_error(e)
        })?;

        Ok(row.map(|r| r.get("payload")))
    }
}

#[async_trait]
impl QueueSource for PostgresQueueSource {
    #[instrument(skip(self))]
    async fn pop_wait(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_pop(key).await? {
                return Ok(Some(payload));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            trace!("Queue empty, re-polling");
            tokio::time::sleep(self.repoll_interval.min(deadline - now)).await;
        }
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO drainq_queue_items (queue_key, payload) VALUES ($1, $2)")
            .bind(key)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            QueueError::Unavailable(err.to_string())
        }
        other => QueueError::Backend(other.to_string()),
    }
}
