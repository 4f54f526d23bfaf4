// Per-run state threaded through every job phase

use crate::errors::JobError;
use crate::models::{
    commit_message, ArtifactSet, ComplianceResult, JobReport, JobRequest, JobState,
    PublishRecord, RepositoryCategory, RepositoryHandle, RepositorySet, Site, SiteEvent,
};
use crate::sync::SyncBatch;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// JobExecutionContext owns everything a single run accumulates.
///
/// Nothing in here is shared between runs. The commit timestamp is captured
/// once at construction and reused by every commit the run makes.
#[derive(Debug)]
pub struct JobExecutionContext {
    pub run_id: Uuid,
    pub request: JobRequest,
    pub timestamp: DateTime<Utc>,
    pub sites: Vec<Site>,
    pub repositories: RepositorySet,
    pub artifacts: ArtifactSet,
    pub compliance: Option<ComplianceResult>,
    pub events: Vec<SiteEvent>,
    pub publish_records: Vec<PublishRecord>,
    cancel: CancellationToken,
    state: JobState,
    history: Vec<JobState>,
}

impl JobExecutionContext {
    pub fn new(request: JobRequest, cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request,
            timestamp: Utc::now(),
            sites: Vec::new(),
            repositories: RepositorySet::new(),
            artifacts: ArtifactSet::new(),
            compliance: None,
            events: Vec::new(),
            publish_records: Vec::new(),
            cancel,
            state: JobState::Pending,
            history: vec![JobState::Pending],
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Move to `next`, rejecting edges the state machine does not allow
    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "Job state transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Terminate in `Failed`; no-op once the run is already terminal
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = JobState::Failed;
            self.history.push(JobState::Failed);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Operator asked for per-site detail at info level
    pub fn verbose(&self) -> bool {
        self.request.criteria.debug
    }

    /// Commit message for this run; identical for every repository it publishes
    pub fn commit_message(&self) -> String {
        commit_message(self.request.kind.commit_label(), &self.timestamp)
    }

    /// Fold a finished sync batch into the run
    pub fn record_batch(&mut self, batch: SyncBatch) {
        self.events.extend(batch.skipped);
        self.events.extend(batch.failed);
        self.repositories.insert(batch.category, batch.handles);
    }

    pub fn handles(&self, category: RepositoryCategory) -> &[RepositoryHandle] {
        self.repositories
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn into_report(self, error: Option<String>, started_at: DateTime<Utc>) -> JobReport {
        JobReport {
            run_id: self.run_id,
            kind: self.request.kind,
            commit: self.request.commit,
            state: self.state,
            history: self.history,
            sites: self.sites,
            events: self.events,
            publish_records: self.publish_records,
            compliance: self.compliance,
            artifact_count: self.artifacts.len(),
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
