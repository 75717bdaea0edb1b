//! Bluesky platform implementation
//!
//! Talks XRPC to the account's PDS directly with `reqwest`. Write limits on
//! Bluesky are signalled through HTTP 429 plus `Retry-After` /
//! `ratelimit-reset` headers, which `add_to_list` turns into
//! [`AddOutcome::RateLimited`].

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::{BlueskyConfig, Config};
use crate::credentials::CredentialManager;
use crate::error::{PlatformError, Result};
use crate::platforms::urls::LIST_ITEM_COLLECTION;
use crate::platforms::{AddOutcome, Platform};
use crate::types::Liker;

const PAGE_LIMIT: &str = "100";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Used when a 429 carries no usable reset header
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);
/// Floor for server-supplied waits, `Retry-After: 0` included
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);
/// Ceiling for server-supplied waits
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(86_400);

/// Error names that mean the session, not the request, is bad
const AUTH_ERROR_NAMES: [&str; 4] = [
    "AuthenticationRequired",
    "InvalidToken",
    "ExpiredToken",
    "AccountTakedown",
];

/// Body of a non-2xx XRPC response
#[derive(Debug, Default, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// A fully read XRPC response
#[derive(Debug)]
struct XrpcResponse {
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
}

impl XrpcResponse {
    fn error_body(&self) -> XrpcErrorBody {
        serde_json::from_str(&self.body).unwrap_or_default()
    }

    fn error_name(&self) -> Option<String> {
        self.error_body().error
    }

    /// "Name: message" summary of an error response
    fn describe(&self) -> String {
        let body = self.error_body();
        match (body.error, body.message) {
            (Some(error), Some(message)) => format!("{}: {}", error, message),
            (Some(error), None) => error,
            (None, Some(message)) => message,
            (None, None) if self.body.trim().is_empty() => format!("HTTP {}", self.status),
            (None, None) => format!("HTTP {}: {}", self.status, self.body.trim()),
        }
    }

    fn json<T: DeserializeOwned>(&self, method: &str) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            PlatformError::Protocol(format!("Malformed {} response: {}", method, e)).into()
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
    #[serde(default)]
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

#[derive(Debug, Deserialize)]
struct ProfileView {
    did: String,
    handle: String,
}

#[derive(Debug, Deserialize)]
struct Like {
    actor: ProfileView,
}

#[derive(Debug, Deserialize)]
struct GetLikesResponse {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    likes: Vec<Like>,
}

#[derive(Debug, Deserialize)]
struct ListItemView {
    subject: ProfileView,
}

#[derive(Debug, Deserialize)]
struct GetListResponse {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    items: Vec<ListItemView>,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

#[derive(Debug, Clone)]
struct SessionTokens {
    access_jwt: String,
    refresh_jwt: String,
}

/// Map an XRPC error response to PlatformError
fn map_xrpc_error(response: &XrpcResponse, context: &str) -> PlatformError {
    let detail = response.describe();
    let error_name = response.error_name().unwrap_or_default();

    if response.status == StatusCode::UNAUTHORIZED
        || response.status == StatusCode::FORBIDDEN
        || AUTH_ERROR_NAMES.contains(&error_name.as_str())
    {
        return PlatformError::Authentication(format!(
            "Bluesky authentication failed during {}: {}. Check the handle and app password.",
            context, detail
        ));
    }

    if response.status == StatusCode::TOO_MANY_REQUESTS || error_name == "RateLimitExceeded" {
        let wait = response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
        return PlatformError::RateLimit(format!(
            "Bluesky rate limit exceeded during {}: {} (retry in {}s)",
            context,
            detail,
            wait.as_secs()
        ));
    }

    if response.status == StatusCode::NOT_FOUND {
        return PlatformError::NotFound(format!("{}: {}", context, detail));
    }

    if response.status.is_server_error() {
        return PlatformError::Network(format!(
            "Bluesky PDS error during {}: {}",
            context, detail
        ));
    }

    if response.status == StatusCode::BAD_REQUEST {
        return PlatformError::Rejected(format!("{}: {}", context, detail));
    }

    PlatformError::Protocol(format!("{}: {}", context, detail))
}

fn map_transport_error(error: reqwest::Error, context: &str) -> PlatformError {
    if error.is_decode() {
        return PlatformError::Protocol(format!("{}: {}", context, error));
    }
    PlatformError::Network(format!(
        "Network error while contacting Bluesky PDS during {}: {}",
        context, error
    ))
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Wait requested by a rate-limited response
///
/// `Retry-After` (seconds) wins; otherwise the `ratelimit-reset` epoch is
/// measured against `now`. Clamped to `MIN_RETRY_AFTER..=MAX_RETRY_AFTER`.
fn parse_retry_after(headers: &HeaderMap, now: i64) -> Option<Duration> {
    let secs = match header_i64(headers, "retry-after") {
        Some(secs) => secs,
        None => header_i64(headers, "ratelimit-reset")?.saturating_sub(now),
    };
    let secs = secs.clamp(MIN_RETRY_AFTER.as_secs() as i64, MAX_RETRY_AFTER.as_secs() as i64);
    Some(Duration::from_secs(secs as u64))
}

pub struct BlueskyPlatform {
    client: reqwest::Client,
    service: String,
    handle: String,
    app_password: SecretString,
    did: Option<String>,
    tokens: RwLock<Option<SessionTokens>>,
}

impl BlueskyPlatform {
    /// Create a new Bluesky client
    ///
    /// # Arguments
    ///
    /// * `config` - Handle and PDS service URL
    /// * `app_password` - App password for the handle
    pub fn new(config: &BlueskyConfig, app_password: SecretString) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("modtools/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            service: config.service.trim_end_matches('/').to_string(),
            handle: config.handle.clone(),
            app_password,
            did: None,
            tokens: RwLock::new(None),
        })
    }

    /// Look up the app password through the configured credential chain
    pub fn from_config(config: &Config) -> Result<Self> {
        let credentials = CredentialManager::new(config.credentials.storage);
        let password = credentials.app_password(&config.bluesky.handle)?;
        Self::new(&config.bluesky, password)
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    fn url(&self, method: &str) -> String {
        format!("{}/xrpc/{}", self.service, method)
    }

    async fn read(response: reqwest::Response, context: &str) -> Result<XrpcResponse> {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers(), chrono::Utc::now().timestamp());
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(e, context))?;
        Ok(XrpcResponse {
            status,
            retry_after,
            body,
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        bearer: Option<&str>,
        context: &str,
    ) -> Result<XrpcResponse> {
        let request = match bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, context))?;
        Self::read(response, context).await
    }

    async fn create_session(&self) -> Result<SessionResponse> {
        tracing::debug!("Creating Bluesky session for handle: {}", self.handle);

        let request = self
            .client
            .post(self.url("com.atproto.server.createSession"))
            .json(&json!({
                "identifier": self.handle,
                "password": self.app_password.expose_secret(),
            }));
        let response = self.send(request, None, "authentication").await?;

        if !response.status.is_success() {
            if response.status == StatusCode::BAD_REQUEST || response.status == StatusCode::UNAUTHORIZED {
                return Err(PlatformError::Authentication(format!(
                    "Invalid Bluesky credentials for {}: {}",
                    self.handle,
                    response.describe()
                ))
                .into());
            }
            return Err(map_xrpc_error(&response, "authentication").into());
        }

        response.json("createSession")
    }

    /// Swap the refresh token for a new session, falling back to a fresh login
    async fn refresh_session(&self) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        let refresh_jwt = tokens.as_ref().map(|t| t.refresh_jwt.clone());

        if let Some(refresh_jwt) = refresh_jwt {
            let request = self.client.post(self.url("com.atproto.server.refreshSession"));
            let response = self.send(request, Some(&refresh_jwt), "session refresh").await?;
            if response.status.is_success() {
                let session: SessionResponse = response.json("refreshSession")?;
                *tokens = Some(SessionTokens {
                    access_jwt: session.access_jwt,
                    refresh_jwt: session.refresh_jwt,
                });
                tracing::debug!("Refreshed Bluesky session");
                return Ok(());
            }
            tracing::debug!("Session refresh failed ({}), logging in again", response.describe());
        }

        let session = self.create_session().await?;
        *tokens = Some(SessionTokens {
            access_jwt: session.access_jwt,
            refresh_jwt: session.refresh_jwt,
        });
        Ok(())
    }

    async fn access_token(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|t| t.access_jwt.clone())
    }

    /// Authenticated XRPC call, refreshing an expired session once
    async fn call(&self, build: impl Fn() -> reqwest::RequestBuilder, context: &str) -> Result<XrpcResponse> {
        let token = self.access_token().await;
        let response = self.send(build(), token.as_deref(), context).await?;

        if token.is_some() && response.error_name().as_deref() == Some("ExpiredToken") {
            self.refresh_session().await?;
            let token = self.access_token().await;
            return self.send(build(), token.as_deref(), context).await;
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, method: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.url(method);
        let response = self
            .call(|| self.client.get(&url).query(query), method)
            .await?;
        if !response.status.is_success() {
            return Err(map_xrpc_error(&response, method).into());
        }
        response.json(method)
    }
}

#[async_trait]
impl Platform for BlueskyPlatform {
    async fn authenticate(&mut self) -> Result<()> {
        let session = self.create_session().await?;
        tracing::debug!(
            "Bluesky session created for {} ({})",
            session.handle.as_deref().unwrap_or(&self.handle),
            session.did
        );

        self.did = Some(session.did);
        *self.tokens.write().await = Some(SessionTokens {
            access_jwt: session.access_jwt,
            refresh_jwt: session.refresh_jwt,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "bluesky"
    }

    fn session_did(&self) -> Option<&str> {
        self.did.as_deref()
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String> {
        let handle = handle.trim_start_matches('@');
        match self
            .get_json::<ResolveHandleResponse>("com.atproto.identity.resolveHandle", &[("handle", handle)])
            .await
        {
            Ok(resolved) => Ok(resolved.did),
            Err(crate::ModToolsError::Platform(PlatformError::Rejected(detail))) => {
                Err(PlatformError::NotFound(format!("Unable to resolve handle {}: {}", handle, detail)).into())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_likers(&self, post_uri: &str) -> Result<Vec<Liker>> {
        let mut likers = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("uri", post_uri), ("limit", PAGE_LIMIT)];
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }
            let page: GetLikesResponse = self.get_json("app.bsky.feed.getLikes", &query).await?;
            let page_len = page.likes.len();

            for like in page.likes {
                if seen.insert(like.actor.did.clone()) {
                    likers.push(Liker {
                        did: like.actor.did,
                        handle: like.actor.handle,
                    });
                }
            }

            tracing::debug!("Fetched {} likes of {} ({} so far)", page_len, post_uri, likers.len());
            match page.cursor {
                Some(next) if page_len > 0 => cursor = Some(next),
                _ => break,
            }
        }

        Ok(likers)
    }

    async fn list_members(&self, list_uri: &str) -> Result<HashSet<String>> {
        let mut members = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("list", list_uri), ("limit", PAGE_LIMIT)];
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }
            let page: GetListResponse = self.get_json("app.bsky.graph.getList", &query).await?;
            let page_len = page.items.len();
            members.extend(page.items.into_iter().map(|item| item.subject.did));

            match page.cursor {
                Some(next) if page_len > 0 => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!("{} has {} members", list_uri, members.len());
        Ok(members)
    }

    async fn add_to_list(&self, subject: &str, list_uri: &str) -> Result<AddOutcome> {
        let repo = self.did.as_deref().ok_or_else(|| {
            PlatformError::Authentication("Not authenticated with Bluesky".to_string())
        })?;

        let body = json!({
            "repo": repo,
            "collection": LIST_ITEM_COLLECTION,
            "record": {
                "$type": LIST_ITEM_COLLECTION,
                "subject": subject,
                "list": list_uri,
                "createdAt": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            },
        });

        let url = self.url("com.atproto.repo.createRecord");
        let response = self
            .call(|| self.client.post(&url).json(&body), "list addition")
            .await?;

        if response.status.is_success() {
            let created: CreateRecordResponse = response.json("createRecord")?;
            return Ok(AddOutcome::Added {
                record_uri: created.uri,
            });
        }

        match map_xrpc_error(&response, "list addition") {
            PlatformError::RateLimit(_) => Ok(AddOutcome::RateLimited {
                retry_after: response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            }),
            PlatformError::Rejected(_) => Ok(AddOutcome::Rejected {
                reason: response.describe(),
            }),
            other => Err(other.into()),
        }
    }
}
