//! Post and list references
//!
//! Operators paste web URLs; the repository API wants at-uris. Both name a
//! record by (actor, collection, rkey), where the actor may be a handle that
//! still needs resolving to a DID.
//!
//! # Supported Formats
//!
//! - **Web**: `https://bsky.app/profile/<handle|did>/post/<rkey>` and
//!   `https://bsky.app/profile/<handle|did>/lists/<rkey>`
//! - **at-uri**: `at://<handle|did>/app.bsky.feed.post/<rkey>` and
//!   `at://<handle|did>/app.bsky.graph.list/<rkey>`
//!
//! # Example
//!
//! ```
//! use libmodtools::platforms::urls::{parse_post_ref, RecordKind};
//!
//! let post = parse_post_ref("https://bsky.app/profile/alice.bsky.social/post/3kabc").unwrap();
//! assert_eq!(post.kind, RecordKind::Post);
//! assert_eq!(post.actor, "alice.bsky.social");
//! assert_eq!(post.at_uri("did:plc:alice"), "at://did:plc:alice/app.bsky.feed.post/3kabc");
//! ```

use crate::error::{ModToolsError, Result};

pub const POST_COLLECTION: &str = "app.bsky.feed.post";
pub const LIST_COLLECTION: &str = "app.bsky.graph.list";
pub const LIST_ITEM_COLLECTION: &str = "app.bsky.graph.listitem";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Post,
    List,
}

impl RecordKind {
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Post => POST_COLLECTION,
            RecordKind::List => LIST_COLLECTION,
        }
    }

    /// Path segment used by the web app
    fn web_segment(&self) -> &'static str {
        match self {
            RecordKind::Post => "post",
            RecordKind::List => "lists",
        }
    }

    fn noun(&self) -> &'static str {
        match self {
            RecordKind::Post => "post",
            RecordKind::List => "list",
        }
    }
}

/// A record named by actor and record key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    /// Handle or DID of the record's owner
    pub actor: String,
    pub kind: RecordKind,
    pub rkey: String,
}

impl RecordRef {
    /// Whether `actor` is already a DID
    pub fn is_resolved(&self) -> bool {
        is_did(&self.actor)
    }

    /// at-uri with the given owner DID
    pub fn at_uri(&self, did: &str) -> String {
        format!("at://{}/{}/{}", did, self.kind.collection(), self.rkey)
    }
}

pub fn is_did(s: &str) -> bool {
    s.starts_with("did:") && s.len() > 4
}

pub fn parse_post_ref(input: &str) -> Result<RecordRef> {
    parse_record_ref(input, RecordKind::Post)
}

pub fn parse_list_ref(input: &str) -> Result<RecordRef> {
    parse_record_ref(input, RecordKind::List)
}

fn parse_record_ref(input: &str, kind: RecordKind) -> Result<RecordRef> {
    let trimmed = input.trim();
    let invalid = || {
        ModToolsError::InvalidInput(format!(
            "'{}' is not a {} URL (expected https://bsky.app/profile/<handle>/{}/<id> or at://<did>/{}/<id>)",
            input,
            kind.noun(),
            kind.web_segment(),
            kind.collection()
        ))
    };

    let (actor, segment, rkey) = if let Some(rest) = trimmed.strip_prefix("at://") {
        let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        match parts.as_slice() {
            [actor, collection, rkey] if *collection == kind.collection() => (*actor, *collection, *rkey),
            _ => return Err(invalid()),
        }
    } else if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        let without_scheme = trimmed.split_once("://").map(|(_, r)| r).ok_or_else(invalid)?;
        // Drop query string and fragment
        let path = without_scheme
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            [_host, "profile", actor, segment, rkey] if *segment == kind.web_segment() => {
                (*actor, *segment, *rkey)
            }
            _ => return Err(invalid()),
        }
    } else {
        return Err(invalid());
    };

    if actor.is_empty() || rkey.is_empty() || segment.is_empty() {
        return Err(invalid());
    }

    Ok(RecordRef {
        actor: actor.to_string(),
        kind,
        rkey: rkey.to_string(),
    })
}

/// Owner DID of an at-uri
pub fn at_uri_authority(uri: &str) -> Option<&str> {
    uri.strip_prefix("at://")?.split('/').next().filter(|s| !s.is_empty())
}
