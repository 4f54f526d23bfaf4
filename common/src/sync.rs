// Repository synchronization: one component for every category and site
//
// Site-level work runs in parallel behind a semaphore. A site whose repository
// is not configured is skipped, a site whose sync fails is recorded; neither
// stops the rest of the batch.

use crate::errors::SyncError;
use crate::filter::dedup_sites;
use crate::models::{
    RepositoryCategory, RepositoryHandle, RepositoryRef, Site, SiteEvent, SiteEventKind,
    SyncState,
};
use crate::retry::{retry_transient, RetryStrategy};
use crate::runner::JobExecutionContext;
use crate::telemetry::record_repo_sync;
use crate::vcs::{RepositoryCatalog, VersionControl};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_CONCURRENCY: usize = 8;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome of syncing one category across a site population
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncBatch {
    pub category: RepositoryCategory,
    /// Synced handles in site-population order
    pub handles: Vec<RepositoryHandle>,
    pub skipped: Vec<SiteEvent>,
    pub failed: Vec<SiteEvent>,
}

impl SyncBatch {
    fn new(category: RepositoryCategory) -> Self {
        Self {
            category,
            handles: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// At least one site failed to sync; its handle is absent
    pub fn partial_failure(&self) -> bool {
        !self.failed.is_empty()
    }
}

fn site_event(
    category: RepositoryCategory,
    site: &Site,
    kind: SiteEventKind,
    reason: String,
) -> SiteEvent {
    SiteEvent {
        category,
        site_slug: site.slug.clone(),
        repository_slug: category.repository_slug(&site.slug),
        kind,
        reason,
    }
}

fn handle_for(
    category: RepositoryCategory,
    site: &Site,
    repository: RepositoryRef,
    state: SyncState,
) -> RepositoryHandle {
    let last_synced_at = match state {
        SyncState::Fresh => Some(Utc::now()),
        SyncState::Stale => None,
    };
    RepositoryHandle {
        category,
        site_id: site.id.clone(),
        site_slug: site.slug.clone(),
        repository,
        state,
        last_synced_at,
    }
}

async fn sync_one(
    vcs: &dyn VersionControl,
    retry: &dyn RetryStrategy,
    fetch_timeout: Duration,
    category: RepositoryCategory,
    site: &Site,
    repository: RepositoryRef,
) -> Result<RepositoryHandle, SyncError> {
    let repo = &repository;
    let (result, attempts) = retry_transient(retry, fetch_timeout, "fetch", move || {
        vcs.ensure_fresh(repo)
    })
    .await;

    match result {
        Ok(status) => {
            debug!(
                repository = %repository.slug,
                status = ?status,
                attempts = attempts,
                "Repository synchronized"
            );
            Ok(handle_for(category, site, repository, SyncState::Fresh))
        }
        Err(err) => Err(SyncError::from_vcs(&repository.slug, err, attempts)),
    }
}

/// Brings per-site repositories up to date with their remotes
pub struct RepositorySync {
    catalog: Arc<RepositoryCatalog>,
    vcs: Arc<dyn VersionControl>,
    retry: Arc<dyn RetryStrategy>,
    fetch_timeout: Duration,
    concurrency: usize,
}

impl RepositorySync {
    pub fn new(
        catalog: Arc<RepositoryCatalog>,
        vcs: Arc<dyn VersionControl>,
        retry: Arc<dyn RetryStrategy>,
    ) -> Self {
        Self {
            catalog,
            vcs,
            retry,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn catalog(&self) -> &RepositoryCatalog {
        &self.catalog
    }

    /// Handle for the existing checkout, without touching the network
    pub fn local_handle(&self, category: RepositoryCategory, site: &Site) -> Option<RepositoryHandle> {
        self.catalog
            .lookup(category, &site.slug)
            .cloned()
            .map(|repository| handle_for(category, site, repository, SyncState::Stale))
    }

    /// Sync the `<category>-<site_slug>` repository for one site
    #[instrument(skip_all, fields(run_id = %ctx.run_id, category = %category, site = %site.slug))]
    pub async fn ensure_synced(
        &self,
        category: RepositoryCategory,
        site: &Site,
        ctx: &JobExecutionContext,
    ) -> Result<RepositoryHandle, SyncError> {
        let repository = self
            .catalog
            .lookup(category, &site.slug)
            .cloned()
            .ok_or_else(|| SyncError::NotConfigured(category.repository_slug(&site.slug)))?;

        if ctx.is_cancelled() {
            return Err(SyncError::Cancelled(repository.slug));
        }

        sync_one(
            self.vcs.as_ref(),
            self.retry.as_ref(),
            self.fetch_timeout,
            category,
            site,
            repository,
        )
        .await
    }

    /// Sync one category for a whole site population.
    ///
    /// Output order follows `sites`. Once the run is cancelled no further site
    /// is dispatched; syncs already in flight complete.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, category = %category, sites = sites.len()))]
    pub async fn ensure_synced_many(
        &self,
        category: RepositoryCategory,
        sites: &[Site],
        ctx: &JobExecutionContext,
    ) -> SyncBatch {
        let sites = dedup_sites(sites.iter().cloned());
        let verbose = ctx.verbose();
        let cancel = ctx.cancel_token().clone();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(usize, Result<RepositoryHandle, SyncError>)> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, (usize, String)> = HashMap::new();
        let mut batch = SyncBatch::new(category);
        let mut not_dispatched = Vec::new();

        for (index, site) in sites.iter().enumerate() {
            let Some(repository) = self.catalog.lookup(category, &site.slug).cloned() else {
                let slug = category.repository_slug(&site.slug);
                info!(site = %site.slug, repository = %slug, "No repository configured, skipping site");
                record_repo_sync(category, "skipped");
                batch.skipped.push(site_event(
                    category,
                    site,
                    SiteEventKind::Skipped,
                    SyncError::NotConfigured(slug).to_string(),
                ));
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                not_dispatched.push((index, repository.slug));
                continue;
            };

            let vcs = Arc::clone(&self.vcs);
            let retry = Arc::clone(&self.retry);
            let fetch_timeout = self.fetch_timeout;
            let site = site.clone();
            let slug = repository.slug.clone();

            let abort_handle = join_set.spawn(async move {
                let _permit = permit;
                if verbose {
                    info!(site = %site.slug, repository = %repository.slug, "Syncing repository");
                } else {
                    debug!(site = %site.slug, repository = %repository.slug, "Syncing repository");
                }
                let result = sync_one(
                    vcs.as_ref(),
                    retry.as_ref(),
                    fetch_timeout,
                    category,
                    &site,
                    repository,
                )
                .await;
                (index, result)
            });
            in_flight.insert(abort_handle.id(), (index, slug));
        }

        let mut finished = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => finished.push(outcome),
                Err(e) => {
                    error!(error = %e, "Site sync task aborted");
                    if let Some((index, slug)) = in_flight.remove(&e.id()) {
                        finished.push((
                            index,
                            Err(SyncError::TaskLost {
                                slug,
                                reason: e.to_string(),
                            }),
                        ));
                    }
                }
            }
        }
        for (index, slug) in not_dispatched {
            finished.push((index, Err(SyncError::Cancelled(slug))));
        }
        finished.sort_by_key(|(index, _)| *index);

        for (index, result) in finished {
            let site = &sites[index];
            match result {
                Ok(handle) => {
                    record_repo_sync(category, "synced");
                    batch.handles.push(handle);
                }
                Err(err) => {
                    warn!(site = %site.slug, error = %err, "Repository sync failed for site");
                    record_repo_sync(category, "failed");
                    batch
                        .failed
                        .push(site_event(category, site, SiteEventKind::Failed, err.to_string()));
                }
            }
        }

        info!(
            synced = batch.handles.len(),
            skipped = batch.skipped.len(),
            failed = batch.failed.len(),
            "Repository sync batch finished"
        );
        batch
    }
}
