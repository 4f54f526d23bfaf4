// Property-based tests for site filtering

use common::filter::SiteFilter;
use common::inventory::JsonInventory;
use common::models::{DeviceRecord, Site, SiteFilterCriteria};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

const SITES: [&str; 5] = ["nyc", "lon", "ams", "sin", "syd"];
const ROLES: [&str; 3] = ["edge", "spine", "leaf"];
const REGIONS: [&str; 2] = ["amer", "emea"];
const TAGS: [&str; 3] = ["core", "lab", "pci"];

fn device(name: String, site: &str, role: &str, region: &str, tags: Vec<String>) -> DeviceRecord {
    DeviceRecord {
        name,
        site: Site::new(format!("id-{}", site), site),
        tenant: None,
        tenant_group: None,
        region: Some(region.to_string()),
        rack_group: None,
        rack: None,
        role: Some(role.to_string()),
        manufacturer: None,
        platform: None,
        device_type: None,
        tags,
    }
}

/// Inventory in which every role, region and tag is known, plus random devices
fn inventory_strategy() -> impl Strategy<Value = Vec<DeviceRecord>> {
    let row = (
        0..SITES.len(),
        0..ROLES.len(),
        0..REGIONS.len(),
        prop::collection::vec(0..TAGS.len(), 0..3),
    );
    prop::collection::vec(row, 0..30).prop_map(|rows| {
        let mut devices = vec![device(
            "seed".into(),
            SITES[0],
            ROLES[0],
            REGIONS[0],
            TAGS.iter().map(|t| t.to_string()).collect(),
        )];
        for (role, region) in ROLES.iter().zip(REGIONS.iter().cycle()) {
            devices.push(device(format!("seed-{}", role), SITES[1], role, region, vec![]));
        }
        for (i, (site, role, region, tags)) in rows.into_iter().enumerate() {
            devices.push(device(
                format!("dev{}", i),
                SITES[site],
                ROLES[role],
                REGIONS[region],
                tags.into_iter().map(|t| TAGS[t].to_string()).collect(),
            ));
        }
        devices
    })
}

fn subset(pool: &'static [&'static str]) -> impl Strategy<Value = Vec<String>> {
    prop::sample::subsequence(pool.to_vec(), 0..=pool.len())
        .prop_map(|values| values.into_iter().map(String::from).collect())
}

fn criteria_strategy() -> impl Strategy<Value = SiteFilterCriteria> {
    (subset(&ROLES), subset(&REGIONS), subset(&TAGS)).prop_map(|(role, region, tag)| {
        SiteFilterCriteria {
            role,
            region,
            tag,
            ..SiteFilterCriteria::default()
        }
    })
}

fn resolve(devices: Vec<DeviceRecord>, criteria: &SiteFilterCriteria) -> Vec<Site> {
    let filter = SiteFilter::new(Arc::new(JsonInventory::from_devices(devices)));
    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(filter.resolve(criteria))
        .unwrap()
}

fn ids(sites: &[Site]) -> HashSet<String> {
    sites.iter().map(|s| s.id.clone()).collect()
}

/// Property 1: Filter monotonicity
///
/// Adding a constraint to the criteria never grows the resolved population.
#[test]
fn property_filter_monotonicity() {
    proptest!(|(
        devices in inventory_strategy(),
        loose in criteria_strategy(),
        extra_region in 0..REGIONS.len()
    )| {
        let mut strict = loose.clone();
        if strict.region.is_empty() {
            strict.region = vec![REGIONS[extra_region].to_string()];
        } else {
            strict.region.truncate(1);
        }

        let loose_ids = ids(&resolve(devices.clone(), &loose));
        let strict_ids = ids(&resolve(devices, &strict));

        prop_assert!(strict_ids.is_subset(&loose_ids));
    });
}

/// Property 2: Resolve idempotency
///
/// Resolving the same criteria twice against the same inventory yields the
/// same sites in the same order.
#[test]
fn property_resolve_idempotency() {
    proptest!(|(devices in inventory_strategy(), criteria in criteria_strategy())| {
        let first = resolve(devices.clone(), &criteria);
        let second = resolve(devices, &criteria);
        prop_assert_eq!(first, second);
    });
}

/// Property 3: Resolved sites are unique
///
/// A site matching through several devices or dimensions appears once.
#[test]
fn property_resolve_deduplicates() {
    proptest!(|(devices in inventory_strategy(), criteria in criteria_strategy())| {
        let sites = resolve(devices, &criteria);
        prop_assert_eq!(ids(&sites).len(), sites.len());
    });
}

/// Property 4: Empty criteria select every site
#[test]
fn property_empty_criteria_selects_all_sites() {
    proptest!(|(devices in inventory_strategy())| {
        let expected: HashSet<String> = devices.iter().map(|d| d.site.id.clone()).collect();
        let sites = resolve(devices, &SiteFilterCriteria::default());
        prop_assert_eq!(ids(&sites), expected);
    });
}

#[tokio::test]
async fn test_unknown_reference_is_rejected() {
    let inventory = JsonInventory::from_devices(vec![device(
        "edge1".into(),
        "nyc",
        "edge",
        "amer",
        vec![],
    )]);
    let filter = SiteFilter::new(Arc::new(inventory));
    let criteria = SiteFilterCriteria {
        region: vec!["apac".into()],
        ..SiteFilterCriteria::default()
    };

    assert!(filter.resolve(&criteria).await.is_err());
}
