// Site inventory interface and adapters

pub mod json;

use crate::errors::FilterError;
use crate::models::{Site, SiteFilterCriteria};
use async_trait::async_trait;

pub use json::JsonInventory;

/// Query interface of the site/device inventory
#[async_trait]
pub trait SiteInventory: Send + Sync {
    /// Sites owning at least one device that matches `criteria`, in inventory
    /// order. A site is reported once per matching device; callers deduplicate.
    ///
    /// Fails with `FilterError::UnknownReference` when a criterion names an
    /// entity the inventory does not know.
    async fn query_sites(&self, criteria: &SiteFilterCriteria) -> Result<Vec<Site>, FilterError>;
}
