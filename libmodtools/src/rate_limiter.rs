//! Client-side write budget
//!
//! Counts list additions per account in hourly windows, so a long drain stays
//! under the server's write limits instead of running into them. The counts
//! live in the `rate_limits` table and survive restarts.

use crate::error::{DbError, Result};
use crate::Database;

const WINDOW_SECS: i64 = 3600;

/// Hourly budget of list additions
pub struct RateLimiter {
    /// Additions allowed per window; `None` means unlimited
    per_hour: Option<u32>,
}

impl RateLimiter {
    /// `per_hour == 0` disables the budget
    pub fn new(per_hour: u32) -> Self {
        Self {
            per_hour: (per_hour > 0).then_some(per_hour),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.per_hour.is_some()
    }

    /// Whether another addition fits the current window; does not record it
    pub async fn check(&self, db: &Database, bucket: &str, now: i64) -> Result<bool> {
        Ok(self.remaining(db, bucket, now).await? != Some(0))
    }

    /// Additions left in the current window, `None` when unlimited
    pub async fn remaining(&self, db: &Database, bucket: &str, now: i64) -> Result<Option<u32>> {
        let Some(limit) = self.per_hour else {
            return Ok(None);
        };
        let count = get_window_count(db, bucket, window_start(now)).await?;
        Ok(Some(limit.saturating_sub(count)))
    }

    pub async fn record(&self, db: &Database, bucket: &str, now: i64) -> Result<()> {
        increment_window_count(db, bucket, window_start(now)).await
    }

    /// Drop windows that ended before `cutoff`
    pub async fn cleanup_old_windows(&self, db: &Database, cutoff: i64) -> Result<u64> {
        delete_old_windows(db, window_start(cutoff)).await
    }
}

/// Start of the window after the one containing `now`
pub fn next_window_start(now: i64) -> i64 {
    window_start(now) + WINDOW_SECS
}

fn window_start(timestamp: i64) -> i64 {
    timestamp.div_euclid(WINDOW_SECS) * WINDOW_SECS
}

async fn get_window_count(db: &Database, bucket: &str, window_start: i64) -> Result<u32> {
    let row = sqlx::query_as::<_, (i64,)>(
        "SELECT addition_count FROM rate_limits WHERE bucket = ? AND window_start = ?",
    )
    .bind(bucket)
    .bind(window_start)
    .fetch_optional(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(row.map(|r| r.0.max(0) as u32).unwrap_or(0))
}

async fn increment_window_count(db: &Database, bucket: &str, window_start: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rate_limits (bucket, window_start, addition_count)
        VALUES (?, ?, 1)
        ON CONFLICT(bucket, window_start)
        DO UPDATE SET addition_count = addition_count + 1
        "#,
    )
    .bind(bucket)
    .bind(window_start)
    .execute(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

async fn delete_old_windows(db: &Database, cutoff_window: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
        .bind(cutoff_window)
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BUCKET: &str = "bluesky:did:plc:me";

    /// Record an addition if the window allows it, the way a drain does
    async fn try_add(limiter: &RateLimiter, db: &Database, bucket: &str, now: i64) -> bool {
        if !limiter.check(db, bucket, now).await.unwrap() {
            return false;
        }
        limiter.record(db, bucket, now).await.unwrap();
        true
    }

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_blocks_additions_over_budget() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::new(3);
        let now = 1_000_000;

        for i in 0..3 {
            assert!(
                try_add(&limiter, &db, BUCKET, now).await,
                "addition {} should fit the budget",
                i + 1
            );
        }
        assert!(!try_add(&limiter, &db, BUCKET, now).await);
        assert_eq!(limiter.remaining(&db, BUCKET, now).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_next_window_resets_budget() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::new(1);
        let now = 1_000_000;

        assert!(try_add(&limiter, &db, BUCKET, now).await);
        assert!(!limiter.check(&db, BUCKET, now + 10).await.unwrap());
        assert!(limiter.check(&db, BUCKET, next_window_start(now)).await.unwrap());
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::new(1);
        let now = 1_000_000;

        assert!(try_add(&limiter, &db, BUCKET, now).await);
        assert!(try_add(&limiter, &db, "bluesky:did:plc:other", now).await);
    }

    #[tokio::test]
    async fn test_zero_disables_budget() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::new(0);
        assert!(!limiter.is_enabled());

        for _ in 0..10 {
            assert!(try_add(&limiter, &db, BUCKET, 1_000_000).await);
        }
        assert_eq!(limiter.remaining(&db, BUCKET, 1_000_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_check_does_not_record() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::new(1);

        for _ in 0..5 {
            assert!(limiter.check(&db, BUCKET, 1_000_000).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_cleanup_old_windows() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::new(1);
        let old = 1_000_000;
        let now = old + 3 * 3600;

        limiter.record(&db, BUCKET, old).await.unwrap();
        limiter.record(&db, BUCKET, now).await.unwrap();

        let removed = limiter.cleanup_old_windows(&db, now - 3600).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!limiter.check(&db, BUCKET, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_counts_are_stored_per_bucket_and_window() {
        let (_temp, db) = setup_test_db().await;
        let limiter = RateLimiter::new(5);
        limiter.record(&db, BUCKET, 1_000_000).await.unwrap();
        limiter.record(&db, BUCKET, 1_000_010).await.unwrap();

        let row: (String, i64, i64) =
            sqlx::query_as("SELECT bucket, window_start, addition_count FROM rate_limits")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(row, (BUCKET.to_string(), window_start(1_000_000), 2));
    }

    #[test]
    fn test_window_boundaries() {
        assert_eq!(window_start(3599), 0);
        assert_eq!(window_start(3600), 3600);
        assert_eq!(next_window_start(3599), 3600);
        assert_eq!(next_window_start(3600), 7200);
    }
}
