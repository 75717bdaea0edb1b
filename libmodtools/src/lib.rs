//! modtools - moderation-list tooling for Bluesky
//!
//! Stages accounts (for example everyone who liked a post) for addition to a
//! moderation list, then drains the staged actions into the list at whatever
//! pace the server allows. The local SQLite store is the source of truth, so
//! drains can be interrupted and resumed without adding anyone twice.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod queue;
pub mod rate_limiter;
pub mod staging;
pub mod synchronizer;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{CredentialManager, CredentialStore};
pub use db::{ActionFilter, Database};
pub use error::{ModToolsError, Result};
pub use queue::ActionQueue;
pub use staging::{stage_likes, StageReport};
pub use synchronizer::{SyncOptions, SyncReport, Synchronizer};
pub use types::{ActionEvent, ActionStatus, EnqueueOutcome, NewAction, PendingAction, QueueStats};
