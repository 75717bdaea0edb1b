//! Remote list service abstraction
//!
//! The synchronizer and the stager only talk to the network through the
//! [`Platform`] trait. `bluesky` is the real implementation; `mock` scripts
//! outcomes for tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{PlatformError, Result};
use crate::types::Liker;

pub mod bluesky;
pub mod urls;

// Mock platform is available for all builds (not just tests) to support integration tests
pub mod mock;

use urls::{parse_list_ref, parse_post_ref, RecordRef};

/// Result of a single list-add call that reached the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The subject is on the list; `record_uri` names the created list item
    Added { record_uri: String },
    /// The server asked us to back off
    RateLimited { retry_after: Duration },
    /// The server refused this addition for good
    Rejected { reason: String },
}

/// Operations the synchronizer needs from a list service
///
/// Transport failures come back as `PlatformError::Network`, bad credentials
/// as `PlatformError::Authentication`. Rate limiting and permanent refusal of
/// an addition are ordinary outcomes of [`add_to_list`](Platform::add_to_list).
#[async_trait]
pub trait Platform: Send + Sync {
    /// Establish a session. Must be called before any other request.
    async fn authenticate(&mut self) -> Result<()>;

    /// Lowercase identifier, also used as the rate-limit bucket prefix
    fn name(&self) -> &str;

    /// DID of the authenticated account, `None` before `authenticate`
    fn session_did(&self) -> Option<&str>;

    async fn resolve_handle(&self, handle: &str) -> Result<String>;

    /// Likers of a post, all pages, in server order
    async fn fetch_likers(&self, post_uri: &str) -> Result<Vec<Liker>>;

    /// DIDs currently on a list
    async fn list_members(&self, list_uri: &str) -> Result<HashSet<String>>;

    async fn add_to_list(&self, subject: &str, list_uri: &str) -> Result<AddOutcome>;

    /// at-uri of the post a URL points at
    async fn resolve_post(&self, url: &str) -> Result<String> {
        let record = parse_post_ref(url)?;
        self.resolve_record(&record).await
    }

    /// at-uri of the list a URL points at
    async fn resolve_list(&self, url: &str) -> Result<String> {
        let record = parse_list_ref(url)?;
        self.resolve_record(&record).await
    }

    async fn resolve_record(&self, record: &RecordRef) -> Result<String> {
        if record.is_resolved() {
            return Ok(record.at_uri(&record.actor));
        }
        let did = self.resolve_handle(&record.actor).await?;
        Ok(record.at_uri(&did))
    }
}

/// Fail with an authentication error unless a session exists
pub(crate) fn require_session<'a>(platform: &'a dyn Platform) -> Result<&'a str> {
    platform.session_did().ok_or_else(|| {
        PlatformError::Authentication(format!("{} session not established", platform.name())).into()
    })
}
