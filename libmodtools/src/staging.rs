//! Staging of a post's likers for addition to a list

use serde::Serialize;

use crate::error::{ActionError, ModToolsError, Result};
use crate::platforms::Platform;
use crate::queue::ActionQueue;
use crate::types::{EnqueueOutcome, NewAction};

/// Outcome of one `stage_likes` call
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StageReport {
    /// at-uri of the liked post
    pub post: String,
    /// at-uri of the target list
    pub list: String,
    pub likers: usize,
    pub enqueued: usize,
    pub requeued: usize,
    pub already_queued: usize,
    pub already_done: usize,
    pub already_skipped: usize,
}

impl StageReport {
    fn count(&mut self, outcome: EnqueueOutcome) {
        match outcome {
            EnqueueOutcome::Enqueued => self.enqueued += 1,
            EnqueueOutcome::Requeued => self.requeued += 1,
            EnqueueOutcome::AlreadyQueued => self.already_queued += 1,
            EnqueueOutcome::AlreadyDone => self.already_done += 1,
            EnqueueOutcome::AlreadySkipped => self.already_skipped += 1,
        }
    }

    /// Actions that will be picked up by the next drain
    pub fn newly_pending(&self) -> usize {
        self.enqueued + self.requeued
    }
}

/// Enqueue every liker of `post_url` for `list_url`
///
/// Both URLs may be web links or at-uris. Under the strict duplicate policy
/// an already pending liker is counted as `already_queued` instead of
/// aborting the whole batch.
pub async fn stage_likes(
    platform: &dyn Platform,
    queue: &ActionQueue,
    post_url: &str,
    list_url: &str,
) -> Result<StageReport> {
    let post = platform.resolve_post(post_url).await?;
    let list = platform.resolve_list(list_url).await?;
    tracing::debug!("Staging likers of {} for {}", post, list);

    let likers = platform.fetch_likers(&post).await?;
    let mut report = StageReport {
        post,
        list,
        likers: likers.len(),
        ..Default::default()
    };

    for liker in likers {
        let action = NewAction::new(&liker.did, &report.list, post_url.trim()).with_handle(&liker.handle);
        match queue.enqueue_action(&action).await {
            Ok((outcome, _)) => report.count(outcome),
            Err(ModToolsError::Action(ActionError::Duplicate { subject, .. })) => {
                tracing::warn!("{} ({}) is already queued", liker.handle, subject);
                report.already_queued += 1;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        "Staged {} of {} liker(s) of {} for {}",
        report.newly_pending(),
        report.likers,
        report.post,
        report.list
    );
    Ok(report)
}
