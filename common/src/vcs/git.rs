//! Git operations
//!
//! Drives the system `git` binary. Each call is a short-lived child process
//! that is killed if the caller's future is dropped (for example on timeout).

use crate::config::GitConfig;
use crate::errors::VcsError;
use crate::models::{RepositoryRef, SyncStatus};
use crate::vcs::VersionControl;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Client for git operations
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: String,
    author_name: String,
    author_email: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::from_config(&GitConfig::default())
    }
}

impl GitCli {
    pub fn from_config(config: &GitConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        }
    }

    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, VcsError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        debug!(args = ?args, "Running git");
        let output = cmd
            .output()
            .await
            .map_err(|e| VcsError::Io(format!("failed to spawn git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_failure(stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn head(&self, dir: &Path) -> Result<String, VcsError> {
        self.run(Some(dir), &["rev-parse", "HEAD"]).await
    }

    /// `dir` is the top level of a working tree with a readable HEAD.
    ///
    /// A clone killed part-way leaves a `.git` that git rejects; an enclosing
    /// repository must not be mistaken for the checkout either. Failing to
    /// run git at all is an error, never a verdict on the checkout.
    async fn is_checkout(&self, dir: &Path) -> Result<bool, VcsError> {
        if !dir.join(".git").exists() {
            return Ok(false);
        }
        let toplevel = match self.run(Some(dir), &["rev-parse", "--show-toplevel"]).await {
            Ok(toplevel) => toplevel,
            Err(VcsError::Io(e)) => return Err(VcsError::Io(e)),
            Err(_) => return Ok(false),
        };
        let same_dir = match (
            tokio::fs::canonicalize(&toplevel).await,
            tokio::fs::canonicalize(dir).await,
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        match self.head(dir).await {
            Ok(_) => Ok(same_dir),
            Err(VcsError::Io(e)) => Err(VcsError::Io(e)),
            Err(_) => Ok(false),
        }
    }

    async fn clone_into(&self, repo: &RepositoryRef) -> Result<(), VcsError> {
        let path = repo.local_path.as_path();

        if tokio::fs::try_exists(path).await? {
            warn!(path = %path.display(), "Discarding unusable checkout before cloning");
            tokio::fs::remove_dir_all(path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let target = path.to_string_lossy().into_owned();
        let cloned = self
            .run(
                None,
                &[
                    "clone",
                    "--branch",
                    repo.branch.as_str(),
                    repo.remote_url.as_str(),
                    target.as_str(),
                ],
            )
            .await;

        if let Err(e) = cloned {
            if let Err(cleanup) = tokio::fs::remove_dir_all(path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %cleanup, "Failed to remove partial clone");
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Map git's stderr onto the error taxonomy
pub fn classify_git_failure(stderr: &str) -> VcsError {
    let lower = stderr.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "authentication failed",
        "permission denied",
        "could not read username",
        "returned error: 401",
        "returned error: 403",
    ]) {
        VcsError::Authentication(stderr.to_string())
    } else if has(&[
        "repository not found",
        "does not appear to be a git repository",
        "does not exist",
        "returned error: 404",
        "couldn't find remote ref",
    ]) {
        VcsError::RepositoryMissing(stderr.to_string())
    } else if has(&[
        "not possible to fast-forward",
        "conflict",
        "diverging branches",
        "non-fast-forward",
        "[rejected]",
    ]) {
        VcsError::MergeConflict(stderr.to_string())
    } else if has(&[
        "could not resolve host",
        "connection reset",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "early eof",
        "the remote end hung up",
        "unable to access",
    ]) {
        VcsError::Transport(stderr.to_string())
    } else {
        VcsError::CommandFailed(stderr.to_string())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    #[instrument(skip_all, fields(repository = %repo.slug))]
    async fn ensure_fresh(&self, repo: &RepositoryRef) -> Result<SyncStatus, VcsError> {
        let path = repo.local_path.as_path();

        if !self.is_checkout(path).await? {
            self.clone_into(repo).await?;
            info!("Cloned repository");
            return Ok(SyncStatus::Cloned);
        }

        let before = self.head(path).await?;
        self.run(Some(path), &["pull", "--ff-only", "origin", repo.branch.as_str()])
            .await?;
        let after = self.head(path).await?;

        if before == after {
            Ok(SyncStatus::UpToDate)
        } else {
            info!(from = %before, to = %after, "Fast-forwarded repository");
            Ok(SyncStatus::Updated)
        }
    }

    #[instrument(skip_all, fields(repository = %repo.slug))]
    async fn stage_and_commit(
        &self,
        repo: &RepositoryRef,
        message: &str,
    ) -> Result<Option<String>, VcsError> {
        let path = repo.local_path.as_path();

        self.run(Some(path), &["add", "-A"]).await?;
        let status = self.run(Some(path), &["status", "--porcelain"]).await?;
        if status.is_empty() {
            debug!("Nothing to commit");
            return Ok(None);
        }

        let name = format!("user.name={}", self.author_name);
        let email = format!("user.email={}", self.author_email);
        self.run(
            Some(path),
            &["-c", name.as_str(), "-c", email.as_str(), "commit", "-m", message],
        )
        .await?;

        let commit_id = self.head(path).await?;
        info!(commit_id = %commit_id, "Committed changes");
        Ok(Some(commit_id))
    }

    #[instrument(skip_all, fields(repository = %repo.slug))]
    async fn push(&self, repo: &RepositoryRef) -> Result<(), VcsError> {
        let refspec = format!("HEAD:{}", repo.branch);
        self.run(Some(repo.local_path.as_path()), &["push", "origin", refspec.as_str()])
            .await?;
        info!("Pushed to remote");
        Ok(())
    }
}
