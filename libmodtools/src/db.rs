//! Local store for staged actions
//!
//! Every status change goes through [`Database::transition`], which performs a
//! compare-and-swap on the status column and appends the matching audit event
//! in the same transaction. A transition that loses the race (the row is no
//! longer in the expected status) changes nothing and reports `false`.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ActionError, DbError, Result};
use crate::types::{
    ActionEvent, ActionStatus, EnqueueOutcome, NewAction, PendingAction, QueueStats,
    TransitionDetail,
};

const ACTION_COLUMNS: &str = "id, subject, subject_handle, list_uri, source, enqueued_at, status, \
     updated_at, attempts, last_error, remote_record, completed_at";

/// Filters for [`Database::list_actions`]
#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub list: Option<String>,
    pub status: Option<ActionStatus>,
    pub subject: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // Forward slashes work for the SQLite URL on both Windows and Unix
        let db_url = format!("sqlite://{}", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        tracing::debug!("Opened action store at {}", expanded_path);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stage an action, merging with any existing record for the same
    /// (subject, list) pair
    ///
    /// With `reject_duplicate_pending`, an already pending or in-flight pair
    /// fails with `ActionError::Duplicate` instead of being merged.
    pub async fn enqueue(
        &self,
        action: &NewAction,
        reject_duplicate_pending: bool,
    ) -> Result<(EnqueueOutcome, i64)> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO actions (subject, subject_handle, list_uri, source, enqueued_at, status, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT (subject, list_uri) DO NOTHING
            "#,
        )
        .bind(&action.subject)
        .bind(&action.subject_handle)
        .bind(&action.list)
        .bind(&action.source)
        .bind(action.enqueued_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if inserted.rows_affected() == 1 {
            let id = inserted.last_insert_rowid();
            insert_event(
                &mut tx,
                id,
                None,
                ActionStatus::Pending,
                now,
                Some(&format!("staged from {}", action.source)),
            )
            .await?;
            tx.commit().await.map_err(DbError::SqlxError)?;
            return Ok((EnqueueOutcome::Enqueued, id));
        }

        let row = sqlx::query("SELECT id, status FROM actions WHERE subject = ? AND list_uri = ?")
            .bind(&action.subject)
            .bind(&action.list)
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        let id: i64 = row.try_get("id").map_err(DbError::SqlxError)?;
        let status = ActionStatus::from_column(
            &row.try_get::<String, _>("status").map_err(DbError::SqlxError)?,
        )?;

        let outcome = match status {
            ActionStatus::Done => EnqueueOutcome::AlreadyDone,
            ActionStatus::Skipped => EnqueueOutcome::AlreadySkipped,
            ActionStatus::Pending | ActionStatus::InFlight => {
                if reject_duplicate_pending {
                    return Err(ActionError::Duplicate {
                        subject: action.subject.clone(),
                        list: action.list.clone(),
                    }
                    .into());
                }
                EnqueueOutcome::AlreadyQueued
            }
            ActionStatus::Failed => {
                sqlx::query(
                    r#"
                    UPDATE actions
                    SET status = 'pending', enqueued_at = ?, updated_at = ?, completed_at = NULL
                    WHERE id = ? AND status = 'failed'
                    "#,
                )
                .bind(action.enqueued_at)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;
                insert_event(
                    &mut tx,
                    id,
                    Some(ActionStatus::Failed),
                    ActionStatus::Pending,
                    now,
                    Some(&format!("requeued from {}", action.source)),
                )
                .await?;
                EnqueueOutcome::Requeued
            }
        };

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok((outcome, id))
    }

    /// Compare-and-swap the status of one action
    ///
    /// Returns `false` without touching anything when the action is not in
    /// `from` any more.
    pub async fn transition(
        &self,
        id: i64,
        from: ActionStatus,
        to: ActionStatus,
        change: TransitionDetail,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let completed_at = if to.is_terminal() { Some(now) } else { None };
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let updated = sqlx::query(
            r#"
            UPDATE actions
            SET status = ?,
                updated_at = ?,
                attempts = attempts + ?,
                last_error = COALESCE(?, last_error),
                remote_record = COALESCE(?, remote_record),
                completed_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(if change.bump_attempts { 1_i64 } else { 0 })
        .bind(&change.last_error)
        .bind(&change.remote_record)
        .bind(completed_at)
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if updated.rows_affected() != 1 {
            tx.rollback().await.map_err(DbError::SqlxError)?;
            tracing::debug!("Transition {} -> {} lost for action {}", from, to, id);
            return Ok(false);
        }

        insert_event(&mut tx, id, Some(from), to, now, change.detail.as_deref()).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Like [`transition`](Self::transition), but a lost race is an error
    pub async fn expect_transition(
        &self,
        id: i64,
        from: ActionStatus,
        to: ActionStatus,
        change: TransitionDetail,
    ) -> Result<()> {
        if self.transition(id, from, to, change).await? {
            return Ok(());
        }
        let actual = self
            .get_action(id)
            .await?
            .ok_or(ActionError::NotFound(id))?
            .status;
        Err(ActionError::InvalidTransition {
            id,
            expected: from.to_string(),
            actual: actual.to_string(),
        }
        .into())
    }

    pub async fn get_action(&self, id: i64) -> Result<Option<PendingAction>> {
        let row = sqlx::query(&format!("SELECT {} FROM actions WHERE id = ?", ACTION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| action_from_row(&r)).transpose()?)
    }

    /// Oldest pending action for a list (FIFO by enqueue time, then insertion)
    pub async fn next_pending(&self, list: &str) -> Result<Option<PendingAction>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM actions
            WHERE list_uri = ? AND status = 'pending'
            ORDER BY enqueued_at ASC, id ASC
            LIMIT 1
            "#,
            ACTION_COLUMNS
        ))
        .bind(list)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| action_from_row(&r)).transpose()?)
    }

    /// Move in_flight actions last touched before `older_than` back to pending
    ///
    /// Returns the reclaimed ids.
    pub async fn reclaim_stale_in_flight(&self, list: &str, older_than: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM actions
            WHERE list_uri = ? AND status = 'in_flight' AND updated_at < ?
            ORDER BY enqueued_at ASC, id ASC
            "#,
        )
        .bind(list)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut reclaimed = Vec::new();
        for row in rows {
            let id: i64 = row.try_get("id").map_err(DbError::SqlxError)?;
            if self
                .transition(
                    id,
                    ActionStatus::InFlight,
                    ActionStatus::Pending,
                    TransitionDetail::note("reclaimed after in-flight timeout"),
                )
                .await?
            {
                reclaimed.push(id);
            }
        }
        Ok(reclaimed)
    }

    /// Re-arm every failed action of a list
    pub async fn requeue_failed(&self, list: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM actions WHERE list_uri = ? AND status = 'failed' ORDER BY id")
            .bind(list)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let mut requeued = Vec::new();
        for row in rows {
            let id: i64 = row.try_get("id").map_err(DbError::SqlxError)?;
            if self
                .transition(
                    id,
                    ActionStatus::Failed,
                    ActionStatus::Pending,
                    TransitionDetail::note("requeued by operator"),
                )
                .await?
            {
                requeued.push(id);
            }
        }
        Ok(requeued)
    }

    pub async fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<PendingAction>> {
        let mut where_clauses = vec!["1=1"];
        if filter.list.is_some() {
            where_clauses.push("list_uri = ?");
        }
        if filter.status.is_some() {
            where_clauses.push("status = ?");
        }
        if filter.subject.is_some() {
            where_clauses.push("(subject = ? OR subject_handle = ?)");
        }

        let query_str = format!(
            "SELECT {} FROM actions WHERE {} ORDER BY enqueued_at ASC, id ASC LIMIT ?",
            ACTION_COLUMNS,
            where_clauses.join(" AND ")
        );

        // Bind in the same order as the WHERE clauses
        let mut query = sqlx::query(&query_str);
        if let Some(list) = &filter.list {
            query = query.bind(list);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(subject) = &filter.subject {
            query = query.bind(subject).bind(subject);
        }
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        query = query.bind(limit);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(action_from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub async fn stats(&self, list: Option<&str>) -> Result<QueueStats> {
        let (count_sql, oldest_sql) = match list {
            Some(_) => (
                "SELECT status, COUNT(*) AS n FROM actions WHERE list_uri = ? GROUP BY status",
                "SELECT MIN(enqueued_at) AS oldest FROM actions WHERE list_uri = ? AND status = 'pending'",
            ),
            None => (
                "SELECT status, COUNT(*) AS n FROM actions GROUP BY status",
                "SELECT MIN(enqueued_at) AS oldest FROM actions WHERE status = 'pending'",
            ),
        };

        let mut count_query = sqlx::query(count_sql);
        let mut oldest_query = sqlx::query(oldest_sql);
        if let Some(list) = list {
            count_query = count_query.bind(list);
            oldest_query = oldest_query.bind(list);
        }

        let mut stats = QueueStats::default();
        for row in count_query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?
        {
            let status = ActionStatus::from_column(
                &row.try_get::<String, _>("status").map_err(DbError::SqlxError)?,
            )?;
            let count: i64 = row.try_get("n").map_err(DbError::SqlxError)?;
            stats.add(status, count as u64);
        }

        let row = oldest_query
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        stats.oldest_pending = row.try_get("oldest").map_err(DbError::SqlxError)?;

        Ok(stats)
    }

    /// Distinct target lists, for per-list reporting
    pub async fn lists(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT list_uri FROM actions ORDER BY list_uri")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                r.try_get::<String, _>("list_uri")
                    .map_err(|e| DbError::SqlxError(e).into())
            })
            .collect()
    }

    /// Audit trail of one action, oldest first
    pub async fn events(&self, action_id: i64) -> Result<Vec<ActionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action_id, from_status, to_status, at, detail
            FROM action_events
            WHERE action_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(action_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| -> Result<ActionEvent> {
                let from_status: Option<String> = r.try_get("from_status").map_err(DbError::SqlxError)?;
                let to_status: String = r.try_get("to_status").map_err(DbError::SqlxError)?;
                Ok(ActionEvent {
                    id: r.try_get("id").map_err(DbError::SqlxError)?,
                    action_id: r.try_get("action_id").map_err(DbError::SqlxError)?,
                    from_status: from_status
                        .as_deref()
                        .map(ActionStatus::from_column)
                        .transpose()?,
                    to_status: ActionStatus::from_column(&to_status)?,
                    at: r.try_get("at").map_err(DbError::SqlxError)?,
                    detail: r.try_get("detail").map_err(DbError::SqlxError)?,
                })
            })
            .collect()
    }
}

async fn insert_event(
    conn: &mut SqliteConnection,
    action_id: i64,
    from: Option<ActionStatus>,
    to: ActionStatus,
    at: i64,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO action_events (action_id, from_status, to_status, at, detail)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(action_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(at)
    .bind(detail)
    .execute(&mut *conn)
    .await
    .map_err(DbError::SqlxError)?;
    Ok(())
}

fn action_from_row(row: &SqliteRow) -> std::result::Result<PendingAction, DbError> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(PendingAction {
        id: row.try_get("id")?,
        subject: row.try_get("subject")?,
        subject_handle: row.try_get("subject_handle")?,
        list: row.try_get("list_uri")?,
        source: row.try_get("source")?,
        enqueued_at: row.try_get("enqueued_at")?,
        status: ActionStatus::from_column(&status)?,
        updated_at: row.try_get("updated_at")?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        remote_record: row.try_get("remote_record")?,
        completed_at: row.try_get("completed_at")?,
    })
}
