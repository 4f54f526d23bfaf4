// Inventory backed by a JSON export of the device table

use crate::errors::FilterError;
use crate::inventory::SiteInventory;
use crate::models::{DeviceRecord, FilterField, Site, SiteFilterCriteria};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InventoryDocument {
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// In-memory inventory loaded from `{ "devices": [...] }`
#[derive(Debug, Clone)]
pub struct JsonInventory {
    devices: Vec<DeviceRecord>,
    /// Lower-cased known values per dimension, for reference checks
    known: HashMap<FilterField, HashSet<String>>,
}

impl JsonInventory {
    pub fn from_devices(devices: Vec<DeviceRecord>) -> Self {
        let mut known: HashMap<FilterField, HashSet<String>> = HashMap::new();
        for device in &devices {
            for field in FilterField::ALL {
                let entry = known.entry(field).or_default();
                for value in field.device_values(device) {
                    entry.insert(value.to_ascii_lowercase());
                }
            }
        }
        Self { devices, known }
    }

    pub fn from_json(json: &str) -> Result<Self, FilterError> {
        let document: InventoryDocument = serde_json::from_str(json)
            .map_err(|e| FilterError::InventoryMalformed(e.to_string()))?;
        Ok(Self::from_devices(document.devices))
    }

    /// Load the inventory export from disk
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            FilterError::InventoryUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let inventory = Self::from_json(&json)?;
        info!(devices = inventory.devices.len(), "Loaded site inventory");
        Ok(inventory)
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    fn check_references(&self, criteria: &SiteFilterCriteria) -> Result<(), FilterError> {
        for field in criteria.active_fields() {
            let known = self.known.get(&field);
            for value in criteria.values(field) {
                let exists = known
                    .map(|set| set.contains(&value.to_ascii_lowercase()))
                    .unwrap_or(false);
                if !exists {
                    return Err(FilterError::UnknownReference {
                        field: field.to_string(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SiteInventory for JsonInventory {
    async fn query_sites(&self, criteria: &SiteFilterCriteria) -> Result<Vec<Site>, FilterError> {
        self.check_references(criteria)?;

        let sites: Vec<Site> = self
            .devices
            .iter()
            .filter(|device| criteria.matches(device))
            .map(|device| device.site.clone())
            .collect();

        debug!(matched_devices = sites.len(), "Inventory query complete");
        Ok(sites)
    }
}
