//! Content-addressed TTL result cache (C2), backed by SQLite with WAL mode.
//!
//! SQLite connection setup, schema-as-const-string, and the read-through
//! query shape are grounded on the link-index's `SqliteConnectOptions` /
//! `SqlitePoolOptions` pattern; the key and corruption-handling semantics
//! follow the TTL cache this control plane specifies.

use crate::model::CacheEntry;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as AsyncMutex;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    url_hash TEXT PRIMARY KEY,
    normalized_url TEXT NOT NULL,
    result_json TEXT NOT NULL,
    created_at REAL NOT NULL,
    ttl_seconds INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_url_hash ON cache(url_hash);
"#;

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stores: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub hit_rate: f64,
    pub entries: i64,
    pub valid_entries: i64,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheHealth {
    pub connected: bool,
    pub integrity: bool,
    pub journal_mode: String,
    pub error: Option<String>,
}

pub fn hash_url(normalized_url: &str) -> String {
    let digest = Sha256::digest(normalized_url.as_bytes());
    hex::encode(digest)
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Durable key-value map from `sha256(url)` to `{report, created_at, ttl}`.
///
/// A global init-once guard (the `initialized` flag) creates the schema on
/// first use; corruption on read resets the flag so the next write rebuilds
/// the schema rather than failing silently forever.
pub struct TtlCache {
    pool: SqlitePool,
    initialized: AsyncMutex<bool>,
    metrics: CacheMetrics,
    default_ttl_seconds: i64,
}

impl TtlCache {
    pub async fn open(db_path: &Path, default_ttl_seconds: u64) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create cache directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open cache database")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to initialize cache schema")?;

        Ok(Self {
            pool,
            initialized: AsyncMutex::new(true),
            metrics: CacheMetrics::default(),
            default_ttl_seconds: default_ttl_seconds as i64,
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        *initialized = true;
        Ok(())
    }

    /// Returns `None` on a miss, an expired entry, or read corruption.
    /// Corruption on read invalidates the init flag so the next `put` rebuilds
    /// the schema.
    pub async fn get(&self, normalized_url: &str) -> Option<CacheEntry> {
        let key = hash_url(normalized_url);

        let row = match sqlx::query(
            "SELECT result_json, created_at, ttl_seconds FROM cache WHERE url_hash = ?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row,
            Err(_) => {
                *self.initialized.lock().await = false;
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let Some(row) = row else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let result_json: String = row.get("result_json");
        let created_at: f64 = row.get("created_at");
        let ttl_seconds: i64 = row.get("ttl_seconds");

        if now_unix() - created_at > ttl_seconds as f64 {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let report = match serde_json::from_str(&result_json) {
            Ok(value) => value,
            Err(_) => {
                *self.initialized.lock().await = false;
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheEntry {
            report,
            created_at,
            ttl_seconds,
        })
    }

    /// Insert-or-replace. Silent on failure — caching must never break an audit.
    pub async fn put(&self, normalized_url: &str, report: &serde_json::Value) {
        if self.ensure_schema().await.is_err() {
            return;
        }

        let key = hash_url(normalized_url);
        let result_json = match serde_json::to_string(report) {
            Ok(json) => json,
            Err(_) => return,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO cache (url_hash, normalized_url, result_json, created_at, ttl_seconds)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(url_hash) DO UPDATE SET
                normalized_url = excluded.normalized_url,
                result_json = excluded.result_json,
                created_at = excluded.created_at,
                ttl_seconds = excluded.ttl_seconds
            "#,
        )
        .bind(&key)
        .bind(normalized_url)
        .bind(result_json)
        .bind(now_unix())
        .bind(self.default_ttl_seconds)
        .execute(&self.pool)
        .await;

        if result.is_ok() {
            self.metrics.stores.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = now_unix();
        let result = sqlx::query("DELETE FROM cache WHERE (? - created_at) > ttl_seconds")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to clean up expired cache entries")?;
        Ok(result.rows_affected())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM cache")
            .execute(&self.pool)
            .await
            .context("failed to clear cache")?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        let stores = self.metrics.stores.load(Ordering::Relaxed);
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        let entries: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cache")
            .fetch_one(&self.pool)
            .await
            .context("failed to count cache entries")?;

        let now = now_unix();
        let valid_entries: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cache WHERE (? - created_at) <= ttl_seconds",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to count valid cache entries")?;

        let size_bytes: (Option<i64>,) =
            sqlx::query_as("SELECT SUM(LENGTH(result_json)) FROM cache")
                .fetch_one(&self.pool)
                .await
                .context("failed to sum cache size")?;

        Ok(CacheStats {
            hits,
            misses,
            stores,
            hit_rate,
            entries: entries.0,
            valid_entries: valid_entries.0,
            size_bytes: size_bytes.0.unwrap_or(0),
        })
    }

    pub async fn health(&self) -> CacheHealth {
        match sqlx::query("PRAGMA integrity_check").fetch_one(&self.pool).await {
            Ok(row) => {
                let result: String = row.try_get(0).unwrap_or_default();
                CacheHealth {
                    connected: true,
                    integrity: result == "ok",
                    journal_mode: "wal".to_string(),
                    error: None,
                }
            }
            Err(e) => CacheHealth {
                connected: false,
                integrity: false,
                journal_mode: "wal".to_string(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_cache(ttl: u64) -> (TempDir, TtlCache) {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("cache.db");
        let cache = TtlCache::open(&db_path, ttl).await.expect("open cache");
        (dir, cache)
    }

    #[tokio::test]
    async fn round_trip_before_ttl_expiry() {
        let (_dir, cache) = open_cache(3600).await;
        let report = json!({"status": "success"});
        cache.put("https://example.com/", &report).await;

        let entry = cache.get("https://example.com/").await.expect("hit");
        assert_eq!(entry.report, report);
    }

    #[tokio::test]
    async fn miss_after_ttl_expiry() {
        let (_dir, cache) = open_cache(0).await;
        cache.put("https://example.com/", &json!({"status": "success"})).await;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(cache.get("https://example.com/").await.is_none());
    }

    #[tokio::test]
    async fn miss_is_a_miss_not_an_error() {
        let (_dir, cache) = open_cache(3600).await;
        assert!(cache.get("https://never-stored.example/").await.is_none());
    }

    #[tokio::test]
    async fn stats_reflect_hits_and_misses() {
        let (_dir, cache) = open_cache(3600).await;
        cache.put("https://example.com/", &json!({"status": "success"})).await;
        let _ = cache.get("https://example.com/").await;
        let _ = cache.get("https://missing.example/").await;
        let stats = cache.stats().await.expect("stats");
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_stale_rows() {
        let (_dir, cache) = open_cache(0).await;
        cache.put("https://example.com/", &json!({"status": "success"})).await;
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let removed = cache.cleanup_expired().await.expect("cleanup");
        assert_eq!(removed, 1);
    }
}
