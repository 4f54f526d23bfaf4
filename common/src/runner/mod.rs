// Job runner: explicit state machine driving filter, sync, compute and publish
//
// Pending -> Validating -> SyncingRepositories -> Computing -> Publishing -> Completed
// Failed is reachable from every non-terminal state.

pub mod context;

use crate::errors::{ComputeError, JobError};
use crate::filter::SiteFilter;
use crate::models::{
    JobKind, JobReport, JobRequest, JobState, RepositoryCategory, SiteEvent, SiteEventKind,
};
use crate::publish::PublishStep;
use crate::services::{ComplianceService, RenderingService};
use crate::sync::RepositorySync;
use crate::telemetry::record_job_run;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

pub use context::JobExecutionContext;

const DEFAULT_COMPUTE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Executes the three job definitions against a shared set of collaborators
pub struct JobRunner {
    site_filter: SiteFilter,
    sync: RepositorySync,
    publish: PublishStep,
    compliance: Arc<dyn ComplianceService>,
    rendering: Arc<dyn RenderingService>,
    compute_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        site_filter: SiteFilter,
        sync: RepositorySync,
        publish: PublishStep,
        compliance: Arc<dyn ComplianceService>,
        rendering: Arc<dyn RenderingService>,
    ) -> Self {
        Self {
            site_filter,
            sync,
            publish,
            compliance,
            rendering,
            compute_timeout: DEFAULT_COMPUTE_TIMEOUT,
        }
    }

    pub fn with_compute_timeout(mut self, compute_timeout: Duration) -> Self {
        self.compute_timeout = compute_timeout;
        self
    }

    /// Run one job to a terminal state. Never panics on job failure; the
    /// outcome is carried by the report.
    pub async fn run(&self, request: JobRequest, cancel: CancellationToken) -> JobReport {
        let started_at = Utc::now();
        let timer = Instant::now();
        let kind = request.kind;
        let mut ctx = JobExecutionContext::new(request, cancel);

        let span = info_span!("job_run", run_id = %ctx.run_id, kind = %kind, commit = ctx.request.commit);
        let result = self.execute(&mut ctx).instrument(span).await;

        let error = match result {
            Ok(()) => {
                info!(
                    run_id = %ctx.run_id,
                    kind = %kind,
                    sites = ctx.sites.len(),
                    events = ctx.events.len(),
                    "Job completed"
                );
                None
            }
            Err(err) => {
                error!(
                    run_id = %ctx.run_id,
                    kind = %kind,
                    state = %ctx.state(),
                    error = %err,
                    "Job failed"
                );
                ctx.fail();
                Some(err.to_string())
            }
        };

        record_job_run(kind, ctx.state(), timer.elapsed().as_secs_f64());
        ctx.into_report(error, started_at)
    }

    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        ctx.transition(JobState::Validating)?;
        self.validate(ctx).await?;

        match ctx.request.kind {
            JobKind::RefreshOnly => {
                self.sync_repositories(ctx).await?;
                ctx.transition(JobState::Completed)
            }
            JobKind::Compliance => {
                if ctx.request.refresh_repos {
                    self.sync_repositories(ctx).await?;
                } else {
                    info!("Repository refresh not requested, using local checkouts");
                    self.use_local_checkouts(ctx);
                }
                checkpoint(ctx)?;
                ctx.transition(JobState::Computing)?;
                self.compute_compliance(ctx).await?;
                ctx.transition(JobState::Completed)
            }
            JobKind::IntendedGeneration => {
                self.sync_repositories(ctx).await?;
                checkpoint(ctx)?;
                ctx.transition(JobState::Computing)?;
                self.render_intended(ctx).await?;

                if !ctx.request.commit {
                    info!(
                        artifacts = ctx.artifacts.len(),
                        "Dry run, rendered configurations are not published"
                    );
                    return ctx.transition(JobState::Completed);
                }

                checkpoint(ctx)?;
                ctx.transition(JobState::Publishing)?;
                self.publish_intended(ctx).await?;
                ctx.transition(JobState::Completed)
            }
        }
    }

    async fn validate(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        checkpoint(ctx)?;

        if ctx.request.refresh_repos && ctx.request.kind != JobKind::Compliance {
            return Err(JobError::Validation(format!(
                "refresh_repos only applies to compliance jobs, not {}",
                ctx.request.kind
            )));
        }
        if ctx.request.commit && ctx.request.kind != JobKind::IntendedGeneration {
            info!(kind = %ctx.request.kind, "Commit mode has no effect for this job kind");
        }

        ctx.sites = self.site_filter.resolve(&ctx.request.criteria).await?;
        if ctx.sites.is_empty() {
            warn!("Site filter matched no sites");
        }
        Ok(())
    }

    async fn sync_repositories(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        checkpoint(ctx)?;
        ctx.transition(JobState::SyncingRepositories)?;

        for category in ctx.request.kind.required_categories() {
            let batch = self
                .sync
                .ensure_synced_many(*category, &ctx.sites, ctx)
                .await;
            if batch.partial_failure() {
                warn!(
                    category = %category,
                    failed = batch.failed.len(),
                    "Some sites could not be synchronized"
                );
            }
            ctx.record_batch(batch);
        }

        checkpoint(ctx)
    }

    /// Stale handles for every configured checkout, no network access
    fn use_local_checkouts(&self, ctx: &mut JobExecutionContext) {
        for category in ctx.request.kind.required_categories() {
            let mut handles = Vec::new();
            for site in &ctx.sites {
                match self.sync.local_handle(*category, site) {
                    Some(handle) => handles.push(handle),
                    None => ctx.events.push(SiteEvent {
                        category: *category,
                        site_slug: site.slug.clone(),
                        repository_slug: category.repository_slug(&site.slug),
                        kind: SiteEventKind::Skipped,
                        reason: "no repository configured".to_string(),
                    }),
                }
            }
            ctx.repositories.insert(*category, handles);
        }
    }

    async fn compute_compliance(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        let compute = self.compliance.compute(&ctx.sites, &ctx.repositories);
        let result = with_compute_timeout(self.compute_timeout, compute).await?;
        ctx.compliance = Some(result);
        Ok(())
    }

    async fn render_intended(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        let render = self.rendering.render(
            &ctx.sites,
            ctx.handles(RepositoryCategory::JinjaTemplate),
            ctx.handles(RepositoryCategory::Intended),
        );
        let artifacts = with_compute_timeout(self.compute_timeout, render).await?;
        info!(artifacts = artifacts.len(), "Rendered intended configurations");
        ctx.artifacts = artifacts;
        Ok(())
    }

    async fn publish_intended(&self, ctx: &mut JobExecutionContext) -> Result<(), JobError> {
        let message = ctx.commit_message();
        let records = self
            .publish
            .publish(ctx.handles(RepositoryCategory::Intended), &ctx.artifacts, &message)
            .await;

        let attempted = records.len();
        let failed = records.iter().filter(|r| r.is_failure()).count();
        ctx.publish_records = records;

        if failed > 0 {
            return Err(JobError::Publish { failed, attempted });
        }
        Ok(())
    }
}

/// Stop before the next phase once cancellation has been requested
fn checkpoint(ctx: &JobExecutionContext) -> Result<(), JobError> {
    if ctx.is_cancelled() {
        return Err(JobError::Cancelled(ctx.state()));
    }
    Ok(())
}

async fn with_compute_timeout<T>(
    limit: Duration,
    compute: impl Future<Output = Result<T, ComputeError>>,
) -> Result<T, ComputeError> {
    tokio::time::timeout(limit, compute)
        .await
        .map_err(|_| ComputeError::Timeout(limit.as_secs()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VcsError;
    use crate::inventory::JsonInventory;
    use crate::models::{
        ArtifactSet, ComplianceResult, RepositoryHandle, RepositoryRef, RepositorySet, Site,
        SiteFilterCriteria, SyncStatus,
    };
    use crate::retry::FixedDelay;
    use crate::vcs::{RepositoryCatalog, VersionControl};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingVcs {
        fetches: AtomicUsize,
        pushes: AtomicUsize,
    }

    #[async_trait]
    impl VersionControl for CountingVcs {
        async fn ensure_fresh(&self, _repo: &RepositoryRef) -> Result<SyncStatus, VcsError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(SyncStatus::UpToDate)
        }

        async fn stage_and_commit(
            &self,
            repo: &RepositoryRef,
            _message: &str,
        ) -> Result<Option<String>, VcsError> {
            Ok(Some(format!("sha-{}", repo.slug)))
        }

        async fn push(&self, _repo: &RepositoryRef) -> Result<(), VcsError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StaticCompliance;

    #[async_trait]
    impl ComplianceService for StaticCompliance {
        async fn compute(
            &self,
            sites: &[Site],
            repositories: &RepositorySet,
        ) -> Result<ComplianceResult, ComputeError> {
            Ok(ComplianceResult(serde_json::json!({
                "sites": sites.len(),
                "categories": repositories.len(),
            })))
        }
    }

    struct EchoRenderer {
        fail: bool,
    }

    #[async_trait]
    impl RenderingService for EchoRenderer {
        async fn render(
            &self,
            _sites: &[Site],
            _templates: &[RepositoryHandle],
            intended: &[RepositoryHandle],
        ) -> Result<ArtifactSet, ComputeError> {
            if self.fail {
                return Err(ComputeError::ServiceFailed {
                    status: 500,
                    body: "template error".into(),
                });
            }
            let mut artifacts = ArtifactSet::new();
            for handle in intended {
                artifacts.add(handle.slug(), format!("{}.cfg", handle.site_slug));
            }
            Ok(artifacts)
        }
    }

    fn runner(vcs: Arc<CountingVcs>, render_fails: bool) -> JobRunner {
        let inventory = JsonInventory::from_json(
            r#"{"devices": [
                {"name": "a1", "site": {"id": "a", "slug": "a"}},
                {"name": "b1", "site": {"id": "b", "slug": "b"}}
            ]}"#,
        )
        .unwrap();
        let catalog = Arc::new(RepositoryCatalog::new(
            ["backup-a", "backup-b", "intended-a", "intended-b", "jinja_template-a", "jinja_template-b"]
                .iter()
                .map(|slug| RepositoryRef::new(*slug, format!("https://git/{}.git", slug), format!("/r/{}", slug))),
        ));
        let retry = Arc::new(FixedDelay::immediate());

        JobRunner::new(
            SiteFilter::new(Arc::new(inventory)),
            RepositorySync::new(catalog, vcs.clone(), retry.clone()),
            PublishStep::new(vcs, retry),
            Arc::new(StaticCompliance),
            Arc::new(EchoRenderer { fail: render_fails }),
        )
    }

    fn request(kind: JobKind, commit: bool) -> JobRequest {
        JobRequest::new(kind, SiteFilterCriteria::default(), commit)
    }

    #[tokio::test]
    async fn test_refresh_only_never_computes() {
        let vcs = Arc::new(CountingVcs::default());
        let report = runner(vcs.clone(), false)
            .run(request(JobKind::RefreshOnly, false), CancellationToken::new())
            .await;

        assert!(report.is_success());
        assert_eq!(
            report.history,
            vec![
                JobState::Pending,
                JobState::Validating,
                JobState::SyncingRepositories,
                JobState::Completed
            ]
        );
        assert_eq!(vcs.fetches.load(Ordering::SeqCst), 4);
        assert!(report.compliance.is_none());
    }

    #[tokio::test]
    async fn test_compliance_without_refresh_skips_sync() {
        let vcs = Arc::new(CountingVcs::default());
        let report = runner(vcs.clone(), false)
            .run(request(JobKind::Compliance, false), CancellationToken::new())
            .await;

        assert!(report.is_success());
        assert!(!report.history.contains(&JobState::SyncingRepositories));
        assert_eq!(vcs.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(report.compliance.unwrap().0["categories"], 2);
    }

    #[tokio::test]
    async fn test_generation_commit_publishes_every_intended_repository() {
        let vcs = Arc::new(CountingVcs::default());
        let report = runner(vcs.clone(), false)
            .run(request(JobKind::IntendedGeneration, true), CancellationToken::new())
            .await;

        assert!(report.is_success(), "{:?}", report.error);
        assert_eq!(report.publish_records.len(), 2);
        assert_eq!(vcs.pushes.load(Ordering::SeqCst), 2);
        assert!(report.history.contains(&JobState::Publishing));
    }

    #[tokio::test]
    async fn test_generation_dry_run_never_pushes() {
        let vcs = Arc::new(CountingVcs::default());
        let report = runner(vcs.clone(), false)
            .run(request(JobKind::IntendedGeneration, false), CancellationToken::new())
            .await;

        assert!(report.is_success());
        assert!(report.publish_records.is_empty());
        assert_eq!(report.artifact_count, 2);
        assert_eq!(vcs.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_compute_failure_fails_without_publishing() {
        let vcs = Arc::new(CountingVcs::default());
        let report = runner(vcs.clone(), true)
            .run(request(JobKind::IntendedGeneration, true), CancellationToken::new())
            .await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.history[report.history.len() - 2], JobState::Computing);
        assert!(report.error.unwrap().contains("template error"));
        assert_eq!(vcs.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_filter_fails_before_side_effects() {
        let vcs = Arc::new(CountingVcs::default());
        let mut req = request(JobKind::RefreshOnly, false);
        req.criteria.site = vec!["nowhere".into()];

        let report = runner(vcs.clone(), false)
            .run(req, CancellationToken::new())
            .await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(
            report.history,
            vec![JobState::Pending, JobState::Validating, JobState::Failed]
        );
        assert_eq!(vcs.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_no_work() {
        let vcs = Arc::new(CountingVcs::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner(vcs.clone(), false)
            .run(request(JobKind::IntendedGeneration, true), cancel)
            .await;

        assert_eq!(report.state, JobState::Failed);
        assert!(report.error.unwrap().contains("cancelled"));
        assert_eq!(vcs.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(vcs.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_compute_timeout_is_fatal() {
        struct SlowCompliance;

        #[async_trait]
        impl ComplianceService for SlowCompliance {
            async fn compute(
                &self,
                _sites: &[Site],
                _repositories: &RepositorySet,
            ) -> Result<ComplianceResult, ComputeError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(ComplianceResult(serde_json::Value::Null))
            }
        }

        let vcs = Arc::new(CountingVcs::default());
        let mut runner = runner(vcs, false).with_compute_timeout(Duration::from_millis(20));
        runner.compliance = Arc::new(SlowCompliance);

        let report = runner
            .run(request(JobKind::Compliance, false), CancellationToken::new())
            .await;

        assert_eq!(report.state, JobState::Failed);
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_during_compute_prevents_publishing() {
        struct CancellingRenderer {
            cancel: CancellationToken,
        }

        #[async_trait]
        impl RenderingService for CancellingRenderer {
            async fn render(
                &self,
                _sites: &[Site],
                _templates: &[RepositoryHandle],
                intended: &[RepositoryHandle],
            ) -> Result<ArtifactSet, ComputeError> {
                self.cancel.cancel();
                let mut artifacts = ArtifactSet::new();
                for handle in intended {
                    artifacts.add(handle.slug(), format!("{}.cfg", handle.site_slug));
                }
                Ok(artifacts)
            }
        }

        let vcs = Arc::new(CountingVcs::default());
        let cancel = CancellationToken::new();
        let mut runner = runner(vcs.clone(), false);
        runner.rendering = Arc::new(CancellingRenderer {
            cancel: cancel.clone(),
        });

        let report = runner
            .run(request(JobKind::IntendedGeneration, true), cancel)
            .await;

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(
            report.history,
            vec![
                JobState::Pending,
                JobState::Validating,
                JobState::SyncingRepositories,
                JobState::Computing,
                JobState::Failed
            ]
        );
        assert!(report.error.unwrap().contains("cancelled"));
        assert!(report.publish_records.is_empty());
        assert_eq!(vcs.pushes.load(Ordering::SeqCst), 0);
    }
}
