//! Staging and operator operations on the action queue
//!
//! Everything here is local: no network access is needed to enqueue,
//! inspect, re-arm or skip actions.

use crate::db::{ActionFilter, Database};
use crate::error::{ActionError, Result};
use crate::types::{
    ActionEvent, ActionStatus, EnqueueOutcome, NewAction, PendingAction, QueueStats,
    TransitionDetail,
};

#[derive(Clone)]
pub struct ActionQueue {
    db: Database,
    reject_duplicate_pending: bool,
}

impl ActionQueue {
    /// `reject_duplicate_pending` turns re-enqueue of a pending pair into
    /// `ActionError::Duplicate`
    pub fn new(db: Database, reject_duplicate_pending: bool) -> Self {
        Self {
            db,
            reject_duplicate_pending,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Stage `subject` for addition to `list`
    pub async fn enqueue(&self, subject: &str, list: &str, source: &str) -> Result<EnqueueOutcome> {
        let (outcome, _) = self
            .enqueue_action(&NewAction::new(subject, list, source))
            .await?;
        Ok(outcome)
    }

    pub async fn enqueue_action(&self, action: &NewAction) -> Result<(EnqueueOutcome, i64)> {
        let (outcome, id) = self.db.enqueue(action, self.reject_duplicate_pending).await?;
        tracing::debug!(
            action_id = id,
            subject = %action.subject,
            list = %action.list,
            "enqueue: {:?}",
            outcome
        );
        Ok((outcome, id))
    }

    /// Re-arm every failed action of a list; returns how many moved
    pub async fn retry_failed(&self, list: &str) -> Result<usize> {
        let requeued = self.db.requeue_failed(list).await?;
        if !requeued.is_empty() {
            tracing::info!("Requeued {} failed action(s) for {}", requeued.len(), list);
        }
        Ok(requeued.len())
    }

    /// Operator skip of a pending action
    pub async fn skip(&self, id: i64) -> Result<PendingAction> {
        self.db
            .expect_transition(
                id,
                ActionStatus::Pending,
                ActionStatus::Skipped,
                TransitionDetail::note("skipped by operator"),
            )
            .await?;
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<PendingAction> {
        self.db
            .get_action(id)
            .await?
            .ok_or_else(|| ActionError::NotFound(id).into())
    }

    pub async fn list(&self, filter: &ActionFilter) -> Result<Vec<PendingAction>> {
        self.db.list_actions(filter).await
    }

    pub async fn stats(&self, list: Option<&str>) -> Result<QueueStats> {
        self.db.stats(list).await
    }

    /// Per-list stats for every list that has actions
    pub async fn stats_by_list(&self) -> Result<Vec<(String, QueueStats)>> {
        let mut all = Vec::new();
        for list in self.db.lists().await? {
            let stats = self.db.stats(Some(&list)).await?;
            all.push((list, stats));
        }
        Ok(all)
    }

    /// Audit trail of one action; unknown ids are an error
    pub async fn events(&self, id: i64) -> Result<Vec<ActionEvent>> {
        self.get(id).await?;
        self.db.events(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModToolsError;
    use tempfile::TempDir;

    const LIST: &str = "at://did:plc:owner/app.bsky.graph.list/3kmod";
    const SOURCE: &str = "https://bsky.app/profile/owner.bsky.social/post/3kpost";

    async fn setup_queue(strict: bool) -> (TempDir, ActionQueue) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, ActionQueue::new(db, strict))
    }

    #[tokio::test]
    async fn test_enqueue_outcomes() {
        let (_temp, queue) = setup_queue(false).await;

        assert_eq!(queue.enqueue("did:plc:a", LIST, SOURCE).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(
            queue.enqueue("did:plc:a", LIST, SOURCE).await.unwrap(),
            EnqueueOutcome::AlreadyQueued
        );
    }

    #[tokio::test]
    async fn test_strict_queue_rejects_pending_duplicate() {
        let (_temp, queue) = setup_queue(true).await;

        queue.enqueue("did:plc:a", LIST, SOURCE).await.unwrap();
        let err = queue.enqueue("did:plc:a", LIST, SOURCE).await.unwrap_err();
        assert!(matches!(err, ModToolsError::Action(ActionError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn test_skip_pending_action() {
        let (_temp, queue) = setup_queue(false).await;
        let (_, id) = queue
            .enqueue_action(&NewAction::new("did:plc:a", LIST, SOURCE))
            .await
            .unwrap();

        let skipped = queue.skip(id).await.unwrap();
        assert_eq!(skipped.status, ActionStatus::Skipped);

        let events = queue.events(id).await.unwrap();
        assert_eq!(events.last().unwrap().detail.as_deref(), Some("skipped by operator"));

        // Only pending actions can be skipped
        let err = queue.skip(id).await.unwrap_err();
        assert!(matches!(
            err,
            ModToolsError::Action(ActionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_skip_unknown_action() {
        let (_temp, queue) = setup_queue(false).await;
        let err = queue.skip(42).await.unwrap_err();
        assert!(matches!(err, ModToolsError::Action(ActionError::NotFound(42))));
        assert!(queue.events(42).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_failed_counts() {
        let (_temp, queue) = setup_queue(false).await;
        let (_, id) = queue
            .enqueue_action(&NewAction::new("did:plc:a", LIST, SOURCE))
            .await
            .unwrap();
        let db = queue.db();
        db.expect_transition(id, ActionStatus::Pending, ActionStatus::InFlight, TransitionDetail::attempt())
            .await
            .unwrap();
        db.expect_transition(id, ActionStatus::InFlight, ActionStatus::Failed, TransitionDetail::error("no"))
            .await
            .unwrap();

        assert_eq!(queue.retry_failed(LIST).await.unwrap(), 1);
        assert_eq!(queue.retry_failed(LIST).await.unwrap(), 0);
        assert_eq!(queue.get(id).await.unwrap().status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn test_stats_by_list() {
        let (_temp, queue) = setup_queue(false).await;
        queue.enqueue("did:plc:a", LIST, SOURCE).await.unwrap();
        queue.enqueue("did:plc:b", LIST, SOURCE).await.unwrap();
        queue
            .enqueue("did:plc:a", "at://did:plc:owner/app.bsky.graph.list/other", SOURCE)
            .await
            .unwrap();

        let by_list = queue.stats_by_list().await.unwrap();
        assert_eq!(by_list.len(), 2);
        let (_, stats) = by_list.iter().find(|(l, _)| l == LIST).unwrap();
        assert_eq!(stats.pending, 2);
    }
}
