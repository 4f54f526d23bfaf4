// Version-control backend interface and the repository catalog

pub mod git;

use crate::errors::VcsError;
use crate::models::{RepositoryCategory, RepositoryRef, SyncStatus};
use async_trait::async_trait;
use std::collections::HashMap;

pub use git::GitCli;

/// Primitive operations the job runner needs from version control.
///
/// Implementations report transport problems as transient `VcsError`s; the
/// caller owns retrying and timeouts.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone or fast-forward the local checkout to the remote branch
    async fn ensure_fresh(&self, repo: &RepositoryRef) -> Result<SyncStatus, VcsError>;

    /// Stage every change in the checkout and commit it.
    /// Returns `None` when there was nothing to commit.
    async fn stage_and_commit(
        &self,
        repo: &RepositoryRef,
        message: &str,
    ) -> Result<Option<String>, VcsError>;

    /// Push the checked-out branch to its remote
    async fn push(&self, repo: &RepositoryRef) -> Result<(), VcsError>;
}

/// Repositories configured on the platform, keyed by slug
#[derive(Debug, Clone, Default)]
pub struct RepositoryCatalog {
    repositories: HashMap<String, RepositoryRef>,
}

impl RepositoryCatalog {
    pub fn new(repositories: impl IntoIterator<Item = RepositoryRef>) -> Self {
        Self {
            repositories: repositories
                .into_iter()
                .map(|repo| (repo.slug.clone(), repo))
                .collect(),
        }
    }

    pub fn get(&self, slug: &str) -> Option<&RepositoryRef> {
        self.repositories.get(slug)
    }

    /// Repository configured for `<category>-<site_slug>`, if any
    pub fn lookup(&self, category: RepositoryCategory, site_slug: &str) -> Option<&RepositoryRef> {
        self.get(&category.repository_slug(site_slug))
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}
