//! Drain of staged actions into a remote list
//!
//! One list at a time, one action at a time, oldest first. Every step of an
//! action's life is a compare-and-swap transition in the local store, so a
//! crash or interruption can always be resumed: `done` actions are never
//! touched again and stale `in_flight` ones are reclaimed on the next run.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::{ModToolsError, PlatformError, Result};
use crate::platforms::bluesky::DEFAULT_RETRY_AFTER;
use crate::platforms::{require_session, AddOutcome, Platform};
use crate::queue::ActionQueue;
use crate::rate_limiter::{next_window_start, RateLimiter};
use crate::types::{ActionStatus, EnqueueOutcome, PendingAction, TransitionDetail};

/// Granularity of stop-flag checks while waiting
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Drain tuning, usually built from `[sync]`
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub in_flight_timeout: Duration,
    pub max_backoff: Duration,
    pub max_network_retries: u32,
    /// First network retry delay; doubles on every further retry
    pub network_backoff: Duration,
    pub additions_per_hour: u32,
    pub reject_duplicate_pending: bool,
    pub check_existing_members: bool,
    /// Normalized DIDs and handles that are never added
    pub protected: HashSet<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            in_flight_timeout: Duration::from_secs(600),
            max_backoff: Duration::from_secs(3600),
            max_network_retries: 3,
            network_backoff: Duration::from_secs(1),
            additions_per_hour: 1500,
            reject_duplicate_pending: false,
            check_existing_members: true,
            protected: HashSet::new(),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            in_flight_timeout: config.in_flight_timeout()?,
            max_backoff: config.max_backoff()?,
            max_network_retries: config.max_network_retries,
            additions_per_hour: config.additions_per_hour,
            reject_duplicate_pending: config.reject_duplicate_pending,
            check_existing_members: config.check_existing_members,
            protected: config.protected.iter().map(|p| normalize_actor(p)).collect(),
            ..Self::default()
        })
    }

    pub fn protect(mut self, actor: &str) -> Self {
        self.protected.insert(normalize_actor(actor));
        self
    }
}

fn normalize_actor(actor: &str) -> String {
    actor.trim().trim_start_matches('@').to_lowercase()
}

/// Outcome of one `process` call
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub list: String,
    /// Actions that reached a terminal status in this run
    pub processed: u64,
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Stale in_flight actions moved back to pending before draining
    pub reclaimed: u64,
    /// Backoff waits sat through (remote 429s and the local budget)
    pub rate_limit_waits: u64,
    pub interrupted: bool,
    /// Set when a backoff longer than `max_backoff` stopped the drain
    pub deferred_until: Option<i64>,
}

impl SyncReport {
    fn new(list: &str) -> Self {
        Self {
            list: list.to_string(),
            ..Default::default()
        }
    }

    /// Whether the list has no remaining work from this run's point of view
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.deferred_until.is_none()
    }
}

/// Per-drain facts gathered once before the first action
struct DrainContext {
    self_did: String,
    bucket: String,
    members: HashSet<String>,
}

/// What happened to one claimed action
enum Attempt {
    Added(String),
    Rejected(String),
    Deferred(i64),
    Interrupted,
}

pub struct Synchronizer {
    queue: ActionQueue,
    platform: Box<dyn Platform>,
    options: SyncOptions,
    limiter: RateLimiter,
    shutdown: Arc<AtomicBool>,
}

impl Synchronizer {
    pub fn new(db: Database, platform: Box<dyn Platform>, options: SyncOptions) -> Self {
        Self {
            queue: ActionQueue::new(db, options.reject_duplicate_pending),
            platform,
            limiter: RateLimiter::new(options.additions_per_hour),
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an externally owned stop flag (e.g. one set by a signal handler)
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    fn db(&self) -> &Database {
        self.queue.db()
    }

    fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Authenticate unless a session already exists
    pub async fn connect(&mut self) -> Result<()> {
        if self.platform.session_did().is_none() {
            self.platform.authenticate().await?;
        }
        Ok(())
    }

    pub async fn enqueue(&self, subject: &str, list: &str, source: &str) -> Result<EnqueueOutcome> {
        self.queue.enqueue(subject, list, source).await
    }

    pub async fn retry_failed(&self, list: &str) -> Result<usize> {
        self.queue.retry_failed(list).await
    }

    pub async fn skip(&self, id: i64) -> Result<PendingAction> {
        self.queue.skip(id).await
    }

    /// Drain every pending action of `list`
    ///
    /// Fails on storage errors (the current action stays `in_flight`),
    /// authentication errors and exhausted network retries (the current
    /// action goes back to `pending`).
    pub async fn process(&mut self, list: &str) -> Result<SyncReport> {
        let mut report = SyncReport::new(list);

        let cutoff = chrono::Utc::now().timestamp() - self.options.in_flight_timeout.as_secs() as i64;
        report.reclaimed = self.db().reclaim_stale_in_flight(list, cutoff).await?.len() as u64;
        if report.reclaimed > 0 {
            tracing::warn!("Reclaimed {} stale in-flight action(s) for {}", report.reclaimed, list);
        }

        if self.db().next_pending(list).await?.is_none() {
            tracing::info!("Nothing pending for {}", list);
            return Ok(report);
        }
        let context = self.prepare(list).await?;

        loop {
            if self.is_stopped() {
                tracing::info!("Stop requested, leaving remaining actions pending");
                report.interrupted = true;
                break;
            }

            let Some(action) = self.db().next_pending(list).await? else {
                break;
            };

            if !self
                .db()
                .transition(action.id, ActionStatus::Pending, ActionStatus::InFlight, TransitionDetail::attempt())
                .await?
            {
                tracing::debug!("Action {} was claimed elsewhere", action.id);
                continue;
            }

            if let Some(reason) = self.skip_reason(&action, &context) {
                self.finish(action.id, ActionStatus::Skipped, TransitionDetail::note(reason))
                    .await?;
                tracing::info!("Skipped {} ({})", action.display_subject(), reason);
                report.skipped += 1;
                report.processed += 1;
                continue;
            }

            match self.attempt(&action, &context, &mut report).await {
                Ok(Attempt::Added(record_uri)) => {
                    self.finish(action.id, ActionStatus::Done, TransitionDetail::added(record_uri))
                        .await?;
                    self.limiter
                        .record(self.db(), &context.bucket, chrono::Utc::now().timestamp())
                        .await?;
                    tracing::info!("Added {} to {}", action.display_subject(), list);
                    report.done += 1;
                    report.processed += 1;
                }
                Ok(Attempt::Rejected(reason)) => {
                    tracing::warn!("Could not add {}: {}", action.display_subject(), reason);
                    self.finish(action.id, ActionStatus::Failed, TransitionDetail::error(reason))
                        .await?;
                    report.failed += 1;
                    report.processed += 1;
                }
                Ok(Attempt::Deferred(until)) => {
                    self.release(action.id, TransitionDetail::note(format!("deferred until {}", until)))
                        .await?;
                    tracing::warn!(
                        "Backoff exceeds {}; stopping drain of {} until {}",
                        humantime::format_duration(self.options.max_backoff),
                        list,
                        until
                    );
                    report.deferred_until = Some(until);
                    break;
                }
                Ok(Attempt::Interrupted) => {
                    self.release(action.id, TransitionDetail::note("interrupted")).await?;
                    report.interrupted = true;
                    break;
                }
                Err(e @ ModToolsError::Database(_)) => return Err(e),
                Err(e) => {
                    self.release(action.id, TransitionDetail::error(e.to_string()))
                        .await?;
                    return Err(e);
                }
            }
        }

        if report.is_complete() {
            tracing::info!(
                "Drained {}: {} done, {} failed, {} skipped",
                list,
                report.done,
                report.failed,
                report.skipped
            );
        }
        Ok(report)
    }

    async fn prepare(&mut self, list: &str) -> Result<DrainContext> {
        self.connect().await?;
        let self_did = require_session(self.platform.as_ref())?.to_string();
        let bucket = format!("{}:{}", self.platform.name(), self_did);

        let members = if self.options.check_existing_members {
            match self.platform.list_members(list).await {
                Ok(members) => members,
                Err(e) if e.is_transient() => {
                    tracing::warn!("Could not fetch members of {} ({}); not deduplicating", list, e);
                    HashSet::new()
                }
                Err(e) => return Err(e),
            }
        } else {
            HashSet::new()
        };

        if self.limiter.is_enabled() {
            let day_ago = chrono::Utc::now().timestamp() - 86_400;
            self.limiter.cleanup_old_windows(self.db(), day_ago).await?;
        }

        Ok(DrainContext {
            self_did,
            bucket,
            members,
        })
    }

    fn skip_reason(&self, action: &PendingAction, context: &DrainContext) -> Option<&'static str> {
        if action.subject == context.self_did {
            return Some("own account");
        }
        let protected = self.options.protected.contains(&normalize_actor(&action.subject))
            || action
                .subject_handle
                .as_deref()
                .is_some_and(|h| self.options.protected.contains(&normalize_actor(h)));
        if protected {
            return Some("protected");
        }
        if context.members.contains(&action.subject) {
            return Some("already on list");
        }
        None
    }

    /// Call the remote until the action is settled, backing off as told
    async fn attempt(
        &self,
        action: &PendingAction,
        context: &DrainContext,
        report: &mut SyncReport,
    ) -> Result<Attempt> {
        let mut network_failures = 0;

        loop {
            let now = chrono::Utc::now().timestamp();
            if !self.limiter.check(self.db(), &context.bucket, now).await? {
                let wait = Duration::from_secs((next_window_start(now) - now).max(1) as u64);
                tracing::info!("Hourly addition budget spent");
                if let Some(settled) = self.back_off(wait, report).await {
                    return Ok(settled);
                }
                continue;
            }

            match self.platform.add_to_list(&action.subject, &action.list).await {
                Ok(AddOutcome::Added { record_uri }) => return Ok(Attempt::Added(record_uri)),
                Ok(AddOutcome::Rejected { reason }) => return Ok(Attempt::Rejected(reason)),
                Ok(AddOutcome::RateLimited { retry_after }) => {
                    if let Some(settled) = self.back_off(retry_after, report).await {
                        return Ok(settled);
                    }
                }
                Err(ModToolsError::Platform(PlatformError::RateLimit(message))) => {
                    tracing::debug!("Rate limited outside a list write: {}", message);
                    if let Some(settled) = self.back_off(DEFAULT_RETRY_AFTER, report).await {
                        return Ok(settled);
                    }
                }
                Err(e @ ModToolsError::Platform(PlatformError::Network(_))) => {
                    network_failures += 1;
                    if network_failures > self.options.max_network_retries {
                        return Err(e);
                    }
                    let delay = self.options.network_backoff * 2u32.saturating_pow(network_failures - 1);
                    tracing::warn!(
                        "{} (retry {}/{} in {})",
                        e,
                        network_failures,
                        self.options.max_network_retries,
                        humantime::format_duration(delay)
                    );
                    if !self.pause(delay).await {
                        return Ok(Attempt::Interrupted);
                    }
                }
                Err(e @ ModToolsError::Platform(PlatformError::Authentication(_))) => return Err(e),
                Err(ModToolsError::Platform(other)) => return Ok(Attempt::Rejected(other.to_string())),
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait out a rate limit; `Some` when the action cannot be retried now
    async fn back_off(&self, wait: Duration, report: &mut SyncReport) -> Option<Attempt> {
        if wait > self.options.max_backoff {
            let now = chrono::Utc::now().timestamp();
            let until = i64::try_from(wait.as_secs())
                .ok()
                .and_then(|secs| now.checked_add(secs))
                .unwrap_or(i64::MAX);
            return Some(Attempt::Deferred(until));
        }

        report.rate_limit_waits += 1;
        tracing::warn!("Rate limited; waiting {}", humantime::format_duration(wait));
        if !self.pause(wait).await {
            return Some(Attempt::Interrupted);
        }
        None
    }

    /// Sleep, returning `false` early if a stop is requested
    async fn pause(&self, wait: Duration) -> bool {
        // `None` when the wait is past what `Instant` can represent: only a stop ends it
        let deadline = Instant::now().checked_add(wait);
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            let left = match deadline {
                Some(deadline) if now >= deadline => return true,
                Some(deadline) => deadline - now,
                None => SHUTDOWN_POLL,
            };
            sleep(left.min(SHUTDOWN_POLL)).await;
        }
    }

    async fn finish(&self, id: i64, to: ActionStatus, change: TransitionDetail) -> Result<()> {
        self.db()
            .expect_transition(id, ActionStatus::InFlight, to, change)
            .await
    }

    /// Hand a claimed action back to the queue
    async fn release(&self, id: i64, change: TransitionDetail) -> Result<()> {
        if !self
            .db()
            .transition(id, ActionStatus::InFlight, ActionStatus::Pending, change)
            .await?
        {
            tracing::warn!("Action {} left in-flight state while being released", id);
        }
        Ok(())
    }
}
