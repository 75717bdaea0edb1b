//! Core types for modtools

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DbError, ModToolsError};

/// Lifecycle of a staged list addition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Done,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 5] = [
        ActionStatus::Pending,
        ActionStatus::InFlight,
        ActionStatus::Done,
        ActionStatus::Failed,
        ActionStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InFlight => "in_flight",
            ActionStatus::Done => "done",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        }
    }

    /// Terminal statuses are never left by the drain itself
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Done | ActionStatus::Failed | ActionStatus::Skipped
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = ModToolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(ActionStatus::Pending),
            "in_flight" => Ok(ActionStatus::InFlight),
            "done" => Ok(ActionStatus::Done),
            "failed" => Ok(ActionStatus::Failed),
            "skipped" => Ok(ActionStatus::Skipped),
            _ => Err(ModToolsError::InvalidInput(format!(
                "Unknown status '{}'. Valid options: pending, in_flight, done, failed, skipped",
                s
            ))),
        }
    }
}

impl ActionStatus {
    /// Parse a status column value
    pub(crate) fn from_column(s: &str) -> Result<Self, DbError> {
        s.parse()
            .map_err(|_| DbError::Corrupt(format!("unknown action status '{}'", s)))
    }
}

/// A staged moderation-list addition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingAction {
    pub id: i64,
    /// DID of the account to add
    pub subject: String,
    /// Handle at the time of staging, for display only
    pub subject_handle: Option<String>,
    /// Canonical at-uri of the target list
    pub list: String,
    /// Where the subject came from (the liked post's URL)
    pub source: String,
    pub enqueued_at: i64,
    pub status: ActionStatus,
    pub updated_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// at-uri of the list item created remotely
    pub remote_record: Option<String>,
    pub completed_at: Option<i64>,
}

impl PendingAction {
    /// Handle if known, DID otherwise
    pub fn display_subject(&self) -> &str {
        self.subject_handle.as_deref().unwrap_or(&self.subject)
    }
}

/// Input for staging a new action
#[derive(Debug, Clone)]
pub struct NewAction {
    pub subject: String,
    pub subject_handle: Option<String>,
    pub list: String,
    pub source: String,
    pub enqueued_at: i64,
}

impl NewAction {
    pub fn new(subject: impl Into<String>, list: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            subject_handle: None,
            list: list.into(),
            source: source.into(),
            enqueued_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.subject_handle = Some(handle.into());
        self
    }

    pub fn enqueued_at(mut self, timestamp: i64) -> Self {
        self.enqueued_at = timestamp;
        self
    }
}

/// What `enqueue` did with a request
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// New pending action created
    Enqueued,
    /// A failed action was re-armed to pending
    Requeued,
    /// Already pending or in flight; nothing changed
    AlreadyQueued,
    /// Already added to the list; nothing changed
    AlreadyDone,
    /// Previously skipped; nothing changed
    AlreadySkipped,
}

/// One entry of the audit log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionEvent {
    pub id: i64,
    pub action_id: i64,
    pub from_status: Option<ActionStatus>,
    pub to_status: ActionStatus,
    pub at: i64,
    pub detail: Option<String>,
}

/// Fields written alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub detail: Option<String>,
    pub last_error: Option<String>,
    pub remote_record: Option<String>,
    pub bump_attempts: bool,
}

impl TransitionDetail {
    pub fn note(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            detail: Some(reason.clone()),
            last_error: Some(reason),
            ..Default::default()
        }
    }

    pub fn added(record_uri: impl Into<String>) -> Self {
        Self {
            remote_record: Some(record_uri.into()),
            ..Default::default()
        }
    }

    pub fn attempt() -> Self {
        Self {
            bump_attempts: true,
            ..Default::default()
        }
    }
}

/// Per-status counts for one list (or all lists)
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    pub oldest_pending: Option<i64>,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.done + self.failed + self.skipped
    }

    pub(crate) fn add(&mut self, status: ActionStatus, count: u64) {
        match status {
            ActionStatus::Pending => self.pending += count,
            ActionStatus::InFlight => self.in_flight += count,
            ActionStatus::Done => self.done += count,
            ActionStatus::Failed => self.failed += count,
            ActionStatus::Skipped => self.skipped += count,
        }
    }
}

/// An account that liked a post
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Liker {
    pub did: String,
    pub handle: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in ActionStatus::ALL {
            assert_eq!(ActionStatus::from_column(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_status_parse_accepts_dashes_and_case() {
        assert_eq!("IN-FLIGHT".parse::<ActionStatus>().unwrap(), ActionStatus::InFlight);
        assert_eq!("Done".parse::<ActionStatus>().unwrap(), ActionStatus::Done);
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        let err = "queued".parse::<ActionStatus>().unwrap_err();
        assert!(err.to_string().contains("Unknown status 'queued'"));
        assert!(ActionStatus::from_column("queued").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ActionStatus::Pending.is_terminal());
        assert!(!ActionStatus::InFlight.is_terminal());
        assert!(ActionStatus::Done.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());
        assert!(ActionStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ActionStatus::InFlight).unwrap();
        assert_eq!(json, "\"in_flight\"");
    }

    #[test]
    fn test_new_action_builder() {
        let action = NewAction::new("did:plc:a", "at://did:plc:me/app.bsky.graph.list/x", "https://bsky.app/profile/me/post/1")
            .with_handle("a.bsky.social")
            .enqueued_at(42);
        assert_eq!(action.subject, "did:plc:a");
        assert_eq!(action.subject_handle.as_deref(), Some("a.bsky.social"));
        assert_eq!(action.enqueued_at, 42);
    }

    #[test]
    fn test_queue_stats_total() {
        let mut stats = QueueStats::default();
        stats.add(ActionStatus::Pending, 3);
        stats.add(ActionStatus::Done, 2);
        stats.add(ActionStatus::Failed, 1);
        assert_eq!(stats.total(), 6);
        assert_eq!(stats.pending, 3);
    }
}
