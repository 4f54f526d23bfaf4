// Publish step: commit and push repositories that received new artifacts

use crate::errors::PublishError;
use crate::models::{ArtifactSet, PublishOutcome, PublishRecord, RepositoryHandle};
use crate::retry::{retry_transient, RetryStrategy};
use crate::telemetry::record_repo_publish;
use crate::vcs::VersionControl;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(120);

/// Persists computed artifacts back to their remotes, one repository at a time
pub struct PublishStep {
    vcs: Arc<dyn VersionControl>,
    retry: Arc<dyn RetryStrategy>,
    push_timeout: Duration,
}

impl PublishStep {
    pub fn new(vcs: Arc<dyn VersionControl>, retry: Arc<dyn RetryStrategy>) -> Self {
        Self {
            vcs,
            retry,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }

    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    /// Commit and push every handle that has artifacts, in handle order.
    ///
    /// Best-effort: a failing repository is recorded and the loop moves on.
    #[instrument(skip_all, fields(repositories = handles.len()))]
    pub async fn publish(
        &self,
        handles: &[RepositoryHandle],
        artifacts: &ArtifactSet,
        message: &str,
    ) -> Vec<PublishRecord> {
        let mut records = Vec::new();

        for handle in handles {
            if !artifacts.has_artifacts(handle.slug()) {
                debug!(repository = %handle.slug(), "No new artifacts, not publishing");
                continue;
            }

            let (commit_id, outcome) = match self.publish_one(handle, message).await {
                Ok(Some(commit_id)) => {
                    record_repo_publish("pushed");
                    (Some(commit_id), PublishOutcome::Pushed)
                }
                Ok(None) => {
                    record_repo_publish("nothing_to_commit");
                    (None, PublishOutcome::NothingToCommit)
                }
                Err((commit_id, err)) => {
                    error!(repository = %handle.slug(), error = %err, "Publish failed");
                    record_repo_publish("failed");
                    (
                        commit_id,
                        PublishOutcome::Failed {
                            reason: err.to_string(),
                        },
                    )
                }
            };

            records.push(PublishRecord {
                repository: handle.clone(),
                message: message.to_string(),
                commit_id,
                outcome,
            });
        }

        info!(
            published = records.iter().filter(|r| !r.is_failure()).count(),
            failed = records.iter().filter(|r| r.is_failure()).count(),
            "Publish step finished"
        );
        records
    }

    /// Commit then push. A push failure still reports the local commit id.
    async fn publish_one(
        &self,
        handle: &RepositoryHandle,
        message: &str,
    ) -> Result<Option<String>, (Option<String>, PublishError)> {
        if !handle.category.is_writable() {
            return Err((None, PublishError::ReadOnlyRepository(handle.slug().to_string())));
        }

        let repo = &handle.repository;
        let commit_id = self
            .vcs
            .stage_and_commit(repo, message)
            .await
            .map_err(|e| {
                (
                    None,
                    PublishError::CommitFailed {
                        slug: repo.slug.clone(),
                        reason: e.to_string(),
                    },
                )
            })?;

        let Some(commit_id) = commit_id else {
            info!(repository = %repo.slug, "Nothing to commit");
            return Ok(None);
        };

        let vcs = self.vcs.as_ref();
        let (pushed, attempts) =
            retry_transient(self.retry.as_ref(), self.push_timeout, "push", move || {
                vcs.push(repo)
            })
            .await;

        match pushed {
            Ok(()) => {
                info!(repository = %repo.slug, commit_id = %commit_id, attempts = attempts, "Published repository");
                Ok(Some(commit_id))
            }
            Err(e) => Err((
                Some(commit_id),
                PublishError::PushFailed {
                    slug: repo.slug.clone(),
                    reason: e.to_string(),
                },
            )),
        }
    }
}
