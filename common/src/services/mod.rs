// Compute-phase services: compliance diffing and intended-config rendering

pub mod http;

use crate::errors::ComputeError;
use crate::models::{ArtifactSet, ComplianceResult, RepositoryHandle, RepositorySet, Site};
use async_trait::async_trait;

pub use http::{HttpComplianceService, HttpRenderingService};

/// Computes divergence between intended and backed-up configuration
#[async_trait]
pub trait ComplianceService: Send + Sync {
    /// Sites without a handle in `repositories` have no configuration available
    async fn compute(
        &self,
        sites: &[Site],
        repositories: &RepositorySet,
    ) -> Result<ComplianceResult, ComputeError>;
}

/// Renders intended configurations from templates
#[async_trait]
pub trait RenderingService: Send + Sync {
    /// Render into the intended checkouts and report what was materialized
    async fn render(
        &self,
        sites: &[Site],
        templates: &[RepositoryHandle],
        intended: &[RepositoryHandle],
    ) -> Result<ArtifactSet, ComputeError>;
}
