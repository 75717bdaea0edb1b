//! Mock list service for testing
//!
//! Scripted responses for `add_to_list` are consumed in order; once the
//! script runs dry every addition succeeds. All call records sit behind
//! `Arc`s so a [`MockRecorder`] taken before the platform is moved into a
//! synchronizer can still inspect what happened.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::urls::LIST_ITEM_COLLECTION;
use crate::platforms::{AddOutcome, Platform};
use crate::types::Liker;

/// One scripted reply to `add_to_list`
#[derive(Debug, Clone)]
pub enum MockResponse {
    Outcome(AddOutcome),
    Error(PlatformError),
}

impl MockResponse {
    pub fn rate_limited(retry_after: Duration) -> Self {
        MockResponse::Outcome(AddOutcome::RateLimited { retry_after })
    }

    pub fn rejected(reason: &str) -> Self {
        MockResponse::Outcome(AddOutcome::Rejected {
            reason: reason.to_string(),
        })
    }

    pub fn network(message: &str) -> Self {
        MockResponse::Error(PlatformError::Network(message.to_string()))
    }
}

type AddHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
struct Shared {
    script: Arc<Mutex<VecDeque<MockResponse>>>,
    add_calls: Arc<Mutex<Vec<(String, String)>>>,
    auth_calls: Arc<Mutex<usize>>,
    members: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

/// Read-only view of a mock's recorded calls
#[derive(Clone)]
pub struct MockRecorder {
    shared: Shared,
}

impl MockRecorder {
    /// `(subject, list)` of every `add_to_list` call, in order
    pub fn add_calls(&self) -> Vec<(String, String)> {
        self.shared.add_calls.lock().unwrap().clone()
    }

    pub fn added_subjects(&self) -> Vec<String> {
        self.add_calls().into_iter().map(|(subject, _)| subject).collect()
    }

    pub fn auth_call_count(&self) -> usize {
        *self.shared.auth_calls.lock().unwrap()
    }

    pub fn remaining_script(&self) -> usize {
        self.shared.script.lock().unwrap().len()
    }

    pub fn members(&self, list_uri: &str) -> HashSet<String> {
        self.shared
            .members
            .lock()
            .unwrap()
            .get(list_uri)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct MockPlatform {
    shared: Shared,
    did: Option<String>,
    auth_error: Option<String>,
    handles: HashMap<String, String>,
    likers: HashMap<String, Vec<Liker>>,
    fetch_error: Option<PlatformError>,
    delay: Duration,
    on_add: Option<AddHook>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub const ACCOUNT_DID: &'static str = "did:plc:mockmoderator";

    pub fn new() -> Self {
        Self {
            shared: Shared::default(),
            did: None,
            auth_error: None,
            handles: HashMap::new(),
            likers: HashMap::new(),
            fetch_error: None,
            delay: Duration::ZERO,
            on_add: None,
        }
    }

    /// Create a mock platform that fails authentication
    pub fn auth_failure(error: &str) -> Self {
        Self {
            auth_error: Some(error.to_string()),
            ..Self::new()
        }
    }

    /// Skip the `authenticate` call in tests that do not care about it
    pub fn authenticated(mut self) -> Self {
        self.did = Some(Self::ACCOUNT_DID.to_string());
        self
    }

    pub fn with_handle(mut self, handle: &str, did: &str) -> Self {
        self.handles.insert(handle.to_string(), did.to_string());
        self
    }

    pub fn with_likers(mut self, post_uri: &str, likers: Vec<Liker>) -> Self {
        self.likers.insert(post_uri.to_string(), likers);
        self
    }

    pub fn with_members(self, list_uri: &str, dids: &[&str]) -> Self {
        self.shared
            .members
            .lock()
            .unwrap()
            .entry(list_uri.to_string())
            .or_default()
            .extend(dids.iter().map(|d| d.to_string()));
        self
    }

    /// Queue replies for the next `add_to_list` calls
    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        self.shared.script.lock().unwrap().extend(responses);
        self
    }

    pub fn with_fetch_error(mut self, error: PlatformError) -> Self {
        self.fetch_error = Some(error);
        self
    }

    /// Simulated latency for every `add_to_list` call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run `hook(subject)` at the start of every `add_to_list` call
    pub fn on_add(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Arc::new(hook));
        self
    }

    pub fn recorder(&self) -> MockRecorder {
        MockRecorder {
            shared: self.shared.clone(),
        }
    }

    fn require_auth(&self) -> Result<()> {
        if self.did.is_none() {
            return Err(PlatformError::Authentication("mock session not established".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn authenticate(&mut self) -> Result<()> {
        *self.shared.auth_calls.lock().unwrap() += 1;

        match &self.auth_error {
            Some(error) => Err(PlatformError::Authentication(error.clone()).into()),
            None => {
                self.did = Some(Self::ACCOUNT_DID.to_string());
                Ok(())
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn session_did(&self) -> Option<&str> {
        self.did.as_deref()
    }

    async fn resolve_handle(&self, handle: &str) -> Result<String> {
        self.handles
            .get(handle)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("Unable to resolve handle {}", handle)).into())
    }

    async fn fetch_likers(&self, post_uri: &str) -> Result<Vec<Liker>> {
        if let Some(error) = &self.fetch_error {
            return Err(error.clone().into());
        }
        Ok(self.likers.get(post_uri).cloned().unwrap_or_default())
    }

    async fn list_members(&self, list_uri: &str) -> Result<HashSet<String>> {
        self.require_auth()?;
        Ok(self.recorder().members(list_uri))
    }

    async fn add_to_list(&self, subject: &str, list_uri: &str) -> Result<AddOutcome> {
        self.require_auth()?;

        if let Some(hook) = &self.on_add {
            hook(subject);
        }

        let call_number = {
            let mut calls = self.shared.add_calls.lock().unwrap();
            calls.push((subject.to_string(), list_uri.to_string()));
            calls.len()
        };

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let scripted = self.shared.script.lock().unwrap().pop_front();
        let outcome = match scripted {
            Some(MockResponse::Error(error)) => return Err(error.into()),
            Some(MockResponse::Outcome(outcome)) => outcome,
            None => AddOutcome::Added {
                record_uri: format!(
                    "at://{}/{}/mock{}",
                    Self::ACCOUNT_DID,
                    LIST_ITEM_COLLECTION,
                    call_number
                ),
            },
        };

        if matches!(outcome, AddOutcome::Added { .. }) {
            self.shared
                .members
                .lock()
                .unwrap()
                .entry(list_uri.to_string())
                .or_default()
                .insert(subject.to_string());
        }

        Ok(outcome)
    }
}
