//! Shared counters with expiry, backing the rate limiter
//!
//! Every counter carries its own expiry; an expired counter reads as absent
//! and restarts at 1 on the next increment. Expiry is the only cleanup.

use crate::error::CounterStoreError;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One window to check: its counter key, the ceiling and the TTL applied on creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLimit {
    pub key: String,
    pub ceiling: u64,
    pub ttl: Duration,
}

/// Result of an atomic check-and-increment
///
/// `counts` follows the order of the limits passed in: post-increment values
/// when admitted, the untouched current values when rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    pub counts: Vec<u64>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one to `key`, creating it with `ttl` if absent or expired
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError>;

    /// Current value, `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError>;

    /// If any counter has reached its ceiling, change nothing and reject;
    /// otherwise increment every counter and admit. Atomic with respect to
    /// all other callers of the same store.
    async fn check_and_increment(
        &self,
        limits: &[WindowLimit],
    ) -> Result<WindowOutcome, CounterStoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: Instant,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process store, correct for a single server instance only
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Counter>>, CounterStoreError> {
        self.counters
            .lock()
            .map_err(|_| CounterStoreError::Unavailable("counter map lock poisoned".to_string()))
    }

    fn bump(counters: &mut HashMap<String, Counter>, key: &str, ttl: Duration, now: Instant) -> u64 {
        match counters.get_mut(key) {
            Some(counter) if counter.is_live(now) => {
                counter.value += 1;
                counter.value
            }
            _ => {
                counters.insert(
                    key.to_string(),
                    Counter {
                        value: 1,
                        expires_at: now + ttl,
                    },
                );
                1
            }
        }
    }

    fn live_value(counters: &HashMap<String, Counter>, key: &str, now: Instant) -> Option<u64> {
        counters
            .get(key)
            .filter(|counter| counter.is_live(now))
            .map(|counter| counter.value)
    }

    /// Remove expired counters, returning how many were removed
    pub fn sweep_expired(&self) -> Result<usize, CounterStoreError> {
        let now = Instant::now();
        let mut counters = self.lock()?;
        let before = counters.len();
        counters.retain(|_, counter| counter.is_live(now));
        Ok(before - counters.len())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|counters| counters.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep expired counters every `interval` until the store is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.sweep_expired() {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Swept expired rate counters"),
                    Err(e) => {
                        tracing::warn!(error = %e, "Rate counter sweep failed");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let now = Instant::now();
        let mut counters = self.lock()?;
        Ok(Self::bump(&mut counters, key, ttl, now))
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        let now = Instant::now();
        let counters = self.lock()?;
        Ok(Self::live_value(&counters, key, now))
    }

    async fn check_and_increment(
        &self,
        limits: &[WindowLimit],
    ) -> Result<WindowOutcome, CounterStoreError> {
        let now = Instant::now();
        let mut counters = self.lock()?;

        let current: Vec<u64> = limits
            .iter()
            .map(|limit| Self::live_value(&counters, &limit.key, now).unwrap_or(0))
            .collect();

        if limits
            .iter()
            .zip(&current)
            .any(|(limit, count)| *count >= limit.ceiling)
        {
            return Ok(WindowOutcome {
                admitted: false,
                counts: current,
            });
        }

        let counts = limits
            .iter()
            .map(|limit| Self::bump(&mut counters, &limit.key, limit.ttl, now))
            .collect();

        Ok(WindowOutcome {
            admitted: true,
            counts,
        })
    }
}

/// Upsert that restarts an expired row in place; binds key, now_ms, expires_at_ms
const UPSERT_COUNTER: &str = r#"
    INSERT INTO rate_counters (key, value, expires_at)
    VALUES (?1, 1, ?3)
    ON CONFLICT(key) DO UPDATE SET
        value = CASE WHEN rate_counters.expires_at <= ?2 THEN 1 ELSE rate_counters.value + 1 END,
        expires_at = CASE WHEN rate_counters.expires_at <= ?2 THEN excluded.expires_at ELSE rate_counters.expires_at END
    RETURNING value
"#;

/// Counters in the `rate_counters` table of a SQLite database
///
/// Several processes pointing at the same file share counters. Expiry is a
/// wall-clock millisecond timestamp.
#[derive(Debug, Clone)]
pub struct SqliteCounterStore {
    pool: SqlitePool,
}

impl SqliteCounterStore {
    /// Connect and run migrations
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = crate::db::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete expired rows, returning how many were removed
    pub async fn sweep_expired(&self) -> Result<u64, CounterStoreError> {
        let result = sqlx::query("DELETE FROM rate_counters WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn to_count(key: &str, value: i64) -> Result<u64, CounterStoreError> {
    u64::try_from(value).map_err(|_| CounterStoreError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let now = now_millis();
        let value: i64 = sqlx::query_scalar(UPSERT_COUNTER)
            .bind(key)
            .bind(now)
            .bind(now.saturating_add(ttl_millis(ttl)))
            .fetch_one(&self.pool)
            .await?;
        to_count(key, value)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM rate_counters WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(now_millis())
                .fetch_optional(&self.pool)
                .await?;
        value.map(|v| to_count(key, v)).transpose()
    }

    async fn check_and_increment(
        &self,
        limits: &[WindowLimit],
    ) -> Result<WindowOutcome, CounterStoreError> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        // First statement is a write: the transaction holds the database
        // write lock before any counter is read.
        sqlx::query("DELETE FROM rate_counters WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let mut current = Vec::with_capacity(limits.len());
        for limit in limits {
            let value: Option<i64> =
                sqlx::query_scalar("SELECT value FROM rate_counters WHERE key = ?")
                    .bind(&limit.key)
                    .fetch_optional(&mut *tx)
                    .await?;
            current.push(to_count(&limit.key, value.unwrap_or(0))?);
        }

        if limits
            .iter()
            .zip(&current)
            .any(|(limit, count)| *count >= limit.ceiling)
        {
            tx.commit().await?;
            return Ok(WindowOutcome {
                admitted: false,
                counts: current,
            });
        }

        let mut counts = Vec::with_capacity(limits.len());
        for limit in limits {
            let value: i64 = sqlx::query_scalar(UPSERT_COUNTER)
                .bind(&limit.key)
                .bind(now)
                .bind(now.saturating_add(ttl_millis(limit.ttl)))
                .fetch_one(&mut *tx)
                .await?;
            counts.push(to_count(&limit.key, value)?);
        }

        tx.commit().await?;

        Ok(WindowOutcome {
            admitted: true,
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(key: &str, ceiling: u64) -> WindowLimit {
        WindowLimit {
            key: key.to_string(),
            ceiling,
            ttl: Duration::from_secs(65),
        }
    }

    #[tokio::test]
    async fn test_memory_increment_and_get() {
        let store = MemoryCounterStore::new();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_counter_expires() {
        let store = MemoryCounterStore::new();
        store.increment("k", Duration::from_secs(60)).await.unwrap();
        store.increment("k", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ttl_set_on_creation_only() {
        let store = MemoryCounterStore::new();
        store.increment("k", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        store.increment("k", Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_check_and_increment_rejects_without_incrementing() {
        let store = MemoryCounterStore::new();
        let limits = [limit("minute", 2), limit("hour", 10)];

        let first = store.check_and_increment(&limits).await.unwrap();
        assert!(first.admitted);
        assert_eq!(first.counts, vec![1, 1]);

        let second = store.check_and_increment(&limits).await.unwrap();
        assert_eq!(second.counts, vec![2, 2]);

        let third = store.check_and_increment(&limits).await.unwrap();
        assert!(!third.admitted);
        assert_eq!(third.counts, vec![2, 2]);
        assert_eq!(store.get("hour").await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_sweep_removes_expired() {
        let store = MemoryCounterStore::new();
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_sweeper_runs_periodically() {
        let store = Arc::new(MemoryCounterStore::new());
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        let sweeper = store.spawn_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.is_empty());

        drop(store);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn test_sqlite_increment_and_get() {
        let store = SqliteCounterStore::connect("sqlite::memory:").await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_sqlite_expired_row_restarts() {
        let store = SqliteCounterStore::connect("sqlite::memory:").await.unwrap();

        sqlx::query("INSERT INTO rate_counters (key, value, expires_at) VALUES ('k', 7, 0)")
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.get("k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_sqlite_check_and_increment() {
        let store = SqliteCounterStore::connect("sqlite::memory:").await.unwrap();
        let limits = [limit("minute", 2), limit("hour", 10)];

        assert!(store.check_and_increment(&limits).await.unwrap().admitted);
        assert!(store.check_and_increment(&limits).await.unwrap().admitted);

        let rejected = store.check_and_increment(&limits).await.unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.counts, vec![2, 2]);
        assert_eq!(store.get("hour").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_sqlite_sweep_expired() {
        let store = SqliteCounterStore::connect("sqlite::memory:").await.unwrap();

        sqlx::query("INSERT INTO rate_counters (key, value, expires_at) VALUES ('old', 3, 0)")
            .execute(&store.pool)
            .await
            .unwrap();
        store.increment("fresh", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.get("fresh").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_sqlite_rejects_negative_value() {
        let store = SqliteCounterStore::connect("sqlite::memory:").await.unwrap();

        sqlx::query(
            "INSERT INTO rate_counters (key, value, expires_at) VALUES ('bad', -1, 9999999999999)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.get("bad").await.unwrap_err();
        assert!(matches!(err, CounterStoreError::InvalidValue { value: -1, .. }));
    }
}
