// HTTP clients for the external compliance and rendering services

use crate::errors::ComputeError;
use crate::models::{ArtifactSet, ComplianceResult, RepositoryHandle, RepositorySet, Site};
use crate::services::{ComplianceService, RenderingService};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

fn build_client(timeout_seconds: u64) -> Result<Client, ComputeError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|e| ComputeError::RequestFailed(format!("Failed to create HTTP client: {}", e)))
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

async fn check_status(response: Response) -> Result<Response, ComputeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ComputeError::ServiceFailed {
        status: status.as_u16(),
        body,
    })
}

/// Compliance-diff service reached over HTTP: `POST {base}/compliance`
pub struct HttpComplianceService {
    client: Client,
    base_url: String,
}

impl HttpComplianceService {
    pub fn new(base_url: impl Into<String>, timeout_seconds: u64) -> Result<Self, ComputeError> {
        Ok(Self {
            client: build_client(timeout_seconds)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl ComplianceService for HttpComplianceService {
    #[instrument(skip_all, fields(sites = sites.len()))]
    async fn compute(
        &self,
        sites: &[Site],
        repositories: &RepositorySet,
    ) -> Result<ComplianceResult, ComputeError> {
        let url = endpoint(&self.base_url, "compliance");
        debug!(url = %url, "Requesting compliance diff");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "sites": sites, "repositories": repositories }))
            .send()
            .await
            .map_err(|e| ComputeError::RequestFailed(e.to_string()))?;

        let diff: serde_json::Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ComputeError::InvalidResponse(e.to_string()))?;

        info!("Compliance diff computed");
        Ok(ComplianceResult(diff))
    }
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    #[serde(default)]
    artifacts: Vec<RenderedArtifact>,
}

#[derive(Debug, Deserialize)]
struct RenderedArtifact {
    repository: String,
    path: String,
    content: String,
}

/// Rendering service reached over HTTP: `POST {base}/render`.
///
/// Rendered documents are written into the matching intended checkout.
pub struct HttpRenderingService {
    client: Client,
    base_url: String,
}

impl HttpRenderingService {
    pub fn new(base_url: impl Into<String>, timeout_seconds: u64) -> Result<Self, ComputeError> {
        Ok(Self {
            client: build_client(timeout_seconds)?,
            base_url: base_url.into(),
        })
    }
}

/// Reject absolute paths and parent traversal so artifacts stay in the checkout
fn checkout_relative(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let safe = !path.is_empty()
        && candidate.components().all(|component| match component {
            // Writing under the git directory could plant hooks that the commit would run
            Component::Normal(name) => !name.eq_ignore_ascii_case(".git"),
            Component::CurDir => true,
            _ => false,
        });
    safe.then(|| candidate.to_path_buf())
}

async fn materialize(
    handle: &RepositoryHandle,
    relative: &Path,
    content: &str,
) -> Result<(), ComputeError> {
    let target = handle.repository.local_path.join(relative);
    let write_err = |e: std::io::Error| ComputeError::ArtifactWriteFailed {
        path: target.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    tokio::fs::write(&target, content).await.map_err(write_err)?;
    Ok(())
}

#[async_trait]
impl RenderingService for HttpRenderingService {
    #[instrument(skip_all, fields(sites = sites.len(), intended = intended.len()))]
    async fn render(
        &self,
        sites: &[Site],
        templates: &[RepositoryHandle],
        intended: &[RepositoryHandle],
    ) -> Result<ArtifactSet, ComputeError> {
        let url = endpoint(&self.base_url, "render");
        debug!(url = %url, "Requesting intended configuration render");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "sites": sites, "templates": templates, "intended": intended }))
            .send()
            .await
            .map_err(|e| ComputeError::RequestFailed(e.to_string()))?;

        let rendered: RenderResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ComputeError::InvalidResponse(e.to_string()))?;

        let mut artifacts = ArtifactSet::new();
        for artifact in rendered.artifacts {
            let handle = intended
                .iter()
                .find(|h| h.slug() == artifact.repository)
                .ok_or_else(|| {
                    ComputeError::InvalidResponse(format!(
                        "artifact targets unsynchronized repository '{}'",
                        artifact.repository
                    ))
                })?;
            let relative = checkout_relative(&artifact.path).ok_or_else(|| {
                ComputeError::InvalidResponse(format!("unsafe artifact path '{}'", artifact.path))
            })?;

            materialize(handle, &relative, &artifact.content).await?;
            artifacts.add(artifact.repository, relative);
        }

        info!(artifacts = artifacts.len(), "Intended configurations rendered");
        Ok(artifacts)
    }
}
