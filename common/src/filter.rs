// Site filter: criteria -> deduplicated, ordered site population

use crate::errors::FilterError;
use crate::inventory::SiteInventory;
use crate::models::{Site, SiteFilterCriteria};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

/// Resolves filter criteria against the inventory
pub struct SiteFilter {
    inventory: Arc<dyn SiteInventory>,
}

impl SiteFilter {
    pub fn new(inventory: Arc<dyn SiteInventory>) -> Self {
        Self { inventory }
    }

    /// Resolve criteria into sites, first-appearance order, one entry per site id.
    ///
    /// Side-effect free. Empty criteria select the whole population.
    #[instrument(skip_all, fields(active_fields = criteria.active_fields().count()))]
    pub async fn resolve(&self, criteria: &SiteFilterCriteria) -> Result<Vec<Site>, FilterError> {
        criteria.validate()?;

        let matched = self.inventory.query_sites(criteria).await?;
        let matched_count = matched.len();
        let sites = dedup_sites(matched);

        info!(
            matched_records = matched_count,
            sites = sites.len(),
            "Resolved site population"
        );
        Ok(sites)
    }
}

/// Keep the first occurrence of every site id, preserving order
pub fn dedup_sites(sites: impl IntoIterator<Item = Site>) -> Vec<Site> {
    let mut seen = HashSet::new();
    sites
        .into_iter()
        .filter(|site| seen.insert(site.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::JsonInventory;

    fn filter() -> SiteFilter {
        let inventory = JsonInventory::from_json(
            r#"{"devices": [
                {"name": "a1", "site": {"id": "a", "slug": "site-a"}, "role": "edge", "tags": ["core"]},
                {"name": "b1", "site": {"id": "b", "slug": "site-b"}, "role": "spine", "tags": ["core"]},
                {"name": "a2", "site": {"id": "a", "slug": "site-a"}, "role": "spine"},
                {"name": "c1", "site": {"id": "c", "slug": "site-c"}, "role": "edge"}
            ]}"#,
        )
        .unwrap();
        SiteFilter::new(Arc::new(inventory))
    }

    fn slugs(sites: &[Site]) -> Vec<&str> {
        sites.iter().map(|s| s.slug.as_str()).collect()
    }

    #[tokio::test]
    async fn test_empty_criteria_selects_everything_once() {
        let sites = filter().resolve(&SiteFilterCriteria::default()).await.unwrap();
        assert_eq!(slugs(&sites), vec!["site-a", "site-b", "site-c"]);
    }

    #[tokio::test]
    async fn test_site_matching_multiple_dimensions_appears_once() {
        let mut criteria = SiteFilterCriteria::default();
        criteria.role = vec!["edge".into(), "spine".into()];
        criteria.tag = vec!["core".into()];

        let sites = filter().resolve(&criteria).await.unwrap();
        assert_eq!(slugs(&sites), vec!["site-a", "site-b"]);
    }

    #[tokio::test]
    async fn test_invalid_value_rejected_before_query() {
        let mut criteria = SiteFilterCriteria::default();
        criteria.site = vec!["not a slug".into()];

        let err = filter().resolve(&criteria).await.unwrap_err();
        assert!(matches!(err, FilterError::InvalidValue { .. }));
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let sites = vec![
            Site::new("2", "b"),
            Site::new("1", "a"),
            Site::new("2", "b"),
        ];
        let deduped = dedup_sites(sites);
        assert_eq!(slugs(&deduped), vec!["b", "a"]);
    }
}
