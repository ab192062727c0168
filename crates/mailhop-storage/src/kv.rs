use crate::StorageError;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Expiring keys and durable FIFO lists on the shared SQLite database.
///
/// Every process that opens the same database file sees the same keys and
/// lists. Writers in this process wake local blocked poppers immediately;
/// writers in other processes are picked up by the poll interval.
#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
    pushed: Arc<Notify>,
    poll_interval: Duration,
}

impl KvStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pushed: Arc::new(Notify::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(10));
        self
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT value, expires_at FROM kv_entries WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((_, Some(expires_at))) if expires_at <= now_millis() => {
                self.delete(key).await?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    /// Stores `value`, replacing any previous value and expiry. `None` keeps
    /// the key until it is deleted.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let expires_at = ttl.map(|ttl| now_millis().saturating_add(duration_millis(ttl)));
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
              value = excluded.value,
              expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replaces the value of a live key without touching its expiry.
    /// Returns false when the key is missing or already expired.
    pub async fn set_keep_ttl(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE kv_entries SET value = ?2
            WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remaining lifetime; `None` for missing keys and keys without expiry.
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let expires_at: Option<Option<i64>> =
            sqlx::query_scalar("SELECT expires_at FROM kv_entries WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let remaining = expires_at
            .flatten()
            .map(|expires_at| expires_at - now_millis())
            .filter(|remaining| *remaining > 0)
            .map(|remaining| Duration::from_millis(remaining as u64));
        Ok(remaining)
    }

    pub async fn purge_expired(&self) -> Result<u64, StorageError> {
        let result =
            sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1")
                .bind(now_millis())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    pub async fn push_back(&self, list: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO kv_lists (list_key, value) VALUES (?1, ?2)")
            .bind(list)
            .bind(value)
            .execute(&self.pool)
            .await?;

        self.pushed.notify_waiters();
        Ok(())
    }

    /// Removes and returns the head of `list` if there is one.
    pub async fn try_pop_front(&self, list: &str) -> Result<Option<String>, StorageError> {
        let value: Option<String> = sqlx::query_scalar(
            r#"
            DELETE FROM kv_lists
            WHERE id = (SELECT id FROM kv_lists WHERE list_key = ?1 ORDER BY id LIMIT 1)
            RETURNING value
            "#,
        )
        .bind(list)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    /// Blocks up to `timeout` for the head of `list`. The element is gone
    /// from the list once this returns it.
    pub async fn pop_front(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StorageError> {
        let deadline = Instant::now() + timeout;

        loop {
            let pushed = self.pushed.notified();
            if let Some(value) = self.try_pop_front(list).await? {
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wait = (deadline - now).min(self.poll_interval);
            let _ = tokio::time::timeout(wait, pushed).await;
        }
    }

    pub async fn list_len(&self, list: &str) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_lists WHERE list_key = ?1")
            .bind(list)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::KvStore;
    use crate::Storage;
    use std::time::Duration;

    async fn store() -> KvStore {
        let storage = Storage::in_memory().await.expect("storage");
        KvStore::new(storage.pool().clone()).with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn keys_expire_after_their_ttl() {
        let kv = store().await;
        kv.set("short", "v1", Some(Duration::from_millis(80)))
            .await
            .expect("set");
        kv.set("forever", "v2", None).await.expect("set");

        assert_eq!(kv.get("short").await.expect("get").as_deref(), Some("v1"));
        assert!(kv.ttl("short").await.expect("ttl").is_some());
        assert!(kv.ttl("forever").await.expect("ttl").is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(kv.get("short").await.expect("get").is_none());
        assert_eq!(kv.get("forever").await.expect("get").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn set_keep_ttl_does_not_extend_expiry() {
        let kv = store().await;
        kv.set("session", "step=1", Some(Duration::from_millis(120)))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(kv.set_keep_ttl("session", "step=2").await.expect("update"));
        let remaining = kv.ttl("session").await.expect("ttl").expect("live");
        assert!(remaining <= Duration::from_millis(70));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!kv.set_keep_ttl("session", "step=3").await.expect("update"));
        assert!(kv.get("session").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn lists_are_fifo_and_pop_removes() {
        let kv = store().await;
        for value in ["a", "b", "c"] {
            kv.push_back("q", value).await.expect("push");
        }
        kv.push_back("other", "x").await.expect("push");

        assert_eq!(kv.list_len("q").await.expect("len"), 3);
        let timeout = Duration::from_millis(50);
        assert_eq!(kv.pop_front("q", timeout).await.expect("pop").as_deref(), Some("a"));
        assert_eq!(kv.pop_front("q", timeout).await.expect("pop").as_deref(), Some("b"));
        assert_eq!(kv.list_len("q").await.expect("len"), 1);
        assert_eq!(kv.list_len("other").await.expect("len"), 1);
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_list_and_wakes_on_push() {
        let kv = store().await;
        assert!(kv
            .pop_front("empty", Duration::from_millis(60))
            .await
            .expect("pop")
            .is_none());

        let producer = kv.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            producer.push_back("late", "hello").await.expect("push");
        });

        let popped = kv
            .pop_front("late", Duration::from_secs(2))
            .await
            .expect("pop");
        assert_eq!(popped.as_deref(), Some("hello"));
        handle.await.expect("producer");
    }

    #[tokio::test]
    async fn purge_removes_only_expired_keys() {
        let kv = store().await;
        kv.set("old", "1", Some(Duration::from_millis(10)))
            .await
            .expect("set");
        kv.set("new", "2", Some(Duration::from_secs(60)))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(kv.purge_expired().await.expect("purge"), 1);
        assert!(kv.get("new").await.expect("get").is_some());
    }
}
