use crate::errors::FilterError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

// ============================================================================
// Inventory Models
// ============================================================================

/// Site is a physical or logical network location owning managed devices
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

impl Site {
    pub fn new(id: impl Into<String>, slug: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            id: id.into(),
            name: slug.clone(),
            slug,
        }
    }
}

/// DeviceRecord is one inventory row; sites are selected through their devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub site: Site,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub tenant_group: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub rack_group: Option<String>,
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Filter dimensions in the order they are validated and reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterField {
    TenantGroup,
    Tenant,
    Region,
    Site,
    RackGroup,
    Rack,
    Role,
    Manufacturer,
    Platform,
    DeviceType,
    Device,
    Tag,
}

impl FilterField {
    pub const ALL: [FilterField; 12] = [
        FilterField::TenantGroup,
        FilterField::Tenant,
        FilterField::Region,
        FilterField::Site,
        FilterField::RackGroup,
        FilterField::Rack,
        FilterField::Role,
        FilterField::Manufacturer,
        FilterField::Platform,
        FilterField::DeviceType,
        FilterField::Device,
        FilterField::Tag,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::TenantGroup => "tenant_group",
            FilterField::Tenant => "tenant",
            FilterField::Region => "region",
            FilterField::Site => "site",
            FilterField::RackGroup => "rack_group",
            FilterField::Rack => "rack",
            FilterField::Role => "role",
            FilterField::Manufacturer => "manufacturer",
            FilterField::Platform => "platform",
            FilterField::DeviceType => "device_type",
            FilterField::Device => "device",
            FilterField::Tag => "tag",
        }
    }

    /// Values a device exposes for this dimension
    pub fn device_values<'a>(&self, device: &'a DeviceRecord) -> Vec<&'a str> {
        fn single(value: &Option<String>) -> Vec<&str> {
            value.as_deref().into_iter().collect()
        }
        match self {
            FilterField::TenantGroup => single(&device.tenant_group),
            FilterField::Tenant => single(&device.tenant),
            FilterField::Region => single(&device.region),
            FilterField::Site => vec![device.site.slug.as_str()],
            FilterField::RackGroup => single(&device.rack_group),
            FilterField::Rack => single(&device.rack),
            FilterField::Role => single(&device.role),
            FilterField::Manufacturer => single(&device.manufacturer),
            FilterField::Platform => single(&device.platform),
            FilterField::DeviceType => single(&device.device_type),
            FilterField::Device => vec![device.name.as_str()],
            FilterField::Tag => device.tags.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^[a-z0-9_-]+$").expect("Invalid slug pattern"))
}

/// SiteFilterCriteria selects the site population a job runs against.
///
/// Every selection field is a multi-select list; an empty list imposes no
/// constraint. Values inside one field are alternatives, fields conjoin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteFilterCriteria {
    pub tenant_group: Vec<String>,
    pub tenant: Vec<String>,
    pub region: Vec<String>,
    pub site: Vec<String>,
    pub rack_group: Vec<String>,
    pub rack: Vec<String>,
    pub role: Vec<String>,
    pub manufacturer: Vec<String>,
    pub platform: Vec<String>,
    pub device_type: Vec<String>,
    pub device: Vec<String>,
    pub tag: Vec<String>,
    pub debug: bool,
}

impl SiteFilterCriteria {
    /// Selected values for a dimension
    pub fn values(&self, field: FilterField) -> &[String] {
        match field {
            FilterField::TenantGroup => &self.tenant_group,
            FilterField::Tenant => &self.tenant,
            FilterField::Region => &self.region,
            FilterField::Site => &self.site,
            FilterField::RackGroup => &self.rack_group,
            FilterField::Rack => &self.rack,
            FilterField::Role => &self.role,
            FilterField::Manufacturer => &self.manufacturer,
            FilterField::Platform => &self.platform,
            FilterField::DeviceType => &self.device_type,
            FilterField::Device => &self.device,
            FilterField::Tag => &self.tag,
        }
    }

    pub fn values_mut(&mut self, field: FilterField) -> &mut Vec<String> {
        match field {
            FilterField::TenantGroup => &mut self.tenant_group,
            FilterField::Tenant => &mut self.tenant,
            FilterField::Region => &mut self.region,
            FilterField::Site => &mut self.site,
            FilterField::RackGroup => &mut self.rack_group,
            FilterField::Rack => &mut self.rack,
            FilterField::Role => &mut self.role,
            FilterField::Manufacturer => &mut self.manufacturer,
            FilterField::Platform => &mut self.platform,
            FilterField::DeviceType => &mut self.device_type,
            FilterField::Device => &mut self.device,
            FilterField::Tag => &mut self.tag,
        }
    }

    /// Dimensions that carry at least one value
    pub fn active_fields(&self) -> impl Iterator<Item = FilterField> + '_ {
        FilterField::ALL
            .into_iter()
            .filter(move |field| !self.values(*field).is_empty())
    }

    /// True when no dimension constrains the population
    pub fn is_unconstrained(&self) -> bool {
        self.active_fields().next().is_none()
    }

    /// Check value syntax; reference existence is checked by the inventory
    pub fn validate(&self) -> Result<(), FilterError> {
        for field in self.active_fields() {
            for value in self.values(field) {
                if value.trim().is_empty() {
                    return Err(FilterError::InvalidValue {
                        field: field.to_string(),
                        reason: "empty value".to_string(),
                    });
                }
                if !slug_pattern().is_match(value) {
                    return Err(FilterError::InvalidValue {
                        field: field.to_string(),
                        reason: format!("'{}' is not a valid slug", value),
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether a device satisfies every active dimension
    pub fn matches(&self, device: &DeviceRecord) -> bool {
        self.active_fields().all(|field| {
            let wanted = self.values(field);
            field
                .device_values(device)
                .into_iter()
                .any(|have| wanted.iter().any(|w| w.eq_ignore_ascii_case(have)))
        })
    }
}

// ============================================================================
// Repository Models
// ============================================================================

/// RepositoryCategory classifies a version-controlled config repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryCategory {
    Backup,
    Intended,
    JinjaTemplate,
}

impl RepositoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryCategory::Backup => "backup",
            RepositoryCategory::Intended => "intended",
            RepositoryCategory::JinjaTemplate => "jinja_template",
        }
    }

    /// Canonical repository slug for a site: `<category>-<site_slug>`
    pub fn repository_slug(&self, site_slug: &str) -> String {
        format!("{}-{}", self.as_str(), site_slug)
    }

    /// Only intended configurations are written back by this system
    pub fn is_writable(&self) -> bool {
        matches!(self, RepositoryCategory::Intended)
    }
}

impl fmt::Display for RepositoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(RepositoryCategory::Backup),
            "intended" => Ok(RepositoryCategory::Intended),
            "jinja_template" => Ok(RepositoryCategory::JinjaTemplate),
            other => Err(format!("Unknown repository category: {}", other)),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

/// RepositoryRef is a configured repository: where it lives remotely and locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub slug: String,
    pub remote_url: String,
    pub local_path: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl RepositoryRef {
    pub fn new(
        slug: impl Into<String>,
        remote_url: impl Into<String>,
        local_path: impl AsRef<Path>,
    ) -> Self {
        Self {
            slug: slug.into(),
            remote_url: remote_url.into(),
            local_path: local_path.as_ref().to_path_buf(),
            branch: default_branch(),
        }
    }
}

/// Local synchronization state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Stale,
    Fresh,
}

/// Outcome reported by the version-control backend for a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Cloned,
    Updated,
    UpToDate,
}

/// RepositoryHandle identifies one synchronized repository within a job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryHandle {
    pub category: RepositoryCategory,
    pub site_id: String,
    pub site_slug: String,
    pub repository: RepositoryRef,
    pub state: SyncState,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl RepositoryHandle {
    pub fn slug(&self) -> &str {
        &self.repository.slug
    }

    pub fn remote_url(&self) -> &str {
        &self.repository.remote_url
    }
}

/// Handles resolved for a run, keyed by category
pub type RepositorySet = BTreeMap<RepositoryCategory, Vec<RepositoryHandle>>;

/// Files materialized into repository checkouts, keyed by repository slug
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub by_repository: BTreeMap<String, Vec<PathBuf>>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, repository_slug: impl Into<String>, path: impl Into<PathBuf>) {
        self.by_repository
            .entry(repository_slug.into())
            .or_default()
            .push(path.into());
    }

    pub fn for_repository(&self, repository_slug: &str) -> &[PathBuf] {
        self.by_repository
            .get(repository_slug)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_artifacts(&self, repository_slug: &str) -> bool {
        !self.for_repository(repository_slug).is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_repository.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque diff document produced by the compliance service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComplianceResult(pub serde_json::Value);

// ============================================================================
// Publish Models
// ============================================================================

/// Result of one repository publish attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishOutcome {
    Pushed,
    NothingToCommit,
    Failed { reason: String },
}

/// PublishRecord is the transient outcome of publishing one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub repository: RepositoryHandle,
    pub message: String,
    pub commit_id: Option<String>,
    pub outcome: PublishOutcome,
}

impl PublishRecord {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Failed { .. })
    }
}

/// Timestamp token embedded in commit messages, shared by a whole run
pub const COMMIT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Build `<JOB_KIND> CONFIG CREATION JOB - <timestamp>`
pub fn commit_message(job_label: &str, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{} CONFIG CREATION JOB - {}",
        job_label,
        timestamp.format(COMMIT_TIMESTAMP_FORMAT)
    )
}

// ============================================================================
// Job Models
// ============================================================================

/// The three job definitions exposed to the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    RefreshOnly,
    Compliance,
    IntendedGeneration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RefreshOnly => "refresh_only",
            JobKind::Compliance => "compliance",
            JobKind::IntendedGeneration => "intended_generation",
        }
    }

    /// Repository categories refreshed before the compute phase, in refresh order
    pub fn required_categories(&self) -> &'static [RepositoryCategory] {
        match self {
            JobKind::RefreshOnly | JobKind::Compliance => {
                &[RepositoryCategory::Intended, RepositoryCategory::Backup]
            }
            JobKind::IntendedGeneration => {
                &[RepositoryCategory::Intended, RepositoryCategory::JinjaTemplate]
            }
        }
    }

    /// Upper-case label used in commit messages
    pub fn commit_label(&self) -> &'static str {
        match self {
            JobKind::RefreshOnly => "REFRESH",
            JobKind::Compliance => "COMPLIANCE",
            JobKind::IntendedGeneration => "INTENDED",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JobRequest is what the invocation surface hands to the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    #[serde(default)]
    pub criteria: SiteFilterCriteria,
    #[serde(default)]
    pub commit: bool,
    /// Only meaningful for compliance jobs
    #[serde(default)]
    pub refresh_repos: bool,
}

impl JobRequest {
    pub fn new(kind: JobKind, criteria: SiteFilterCriteria, commit: bool) -> Self {
        Self {
            kind,
            criteria,
            commit,
            refresh_repos: false,
        }
    }

    pub fn with_refresh_repos(mut self, refresh_repos: bool) -> Self {
        self.refresh_repos = refresh_repos;
        self
    }
}

/// Job run lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Validating,
    SyncingRepositories,
    Computing,
    Publishing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Validating => "validating",
            JobState::SyncingRepositories => "syncing_repositories",
            JobState::Computing => "computing",
            JobState::Publishing => "publishing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Legal edges of the run state machine
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, SyncingRepositories)
                | (Validating, Computing)
                | (SyncingRepositories, Computing)
                | (SyncingRepositories, Completed)
                | (Computing, Publishing)
                | (Computing, Completed)
                | (Publishing, Completed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a site was left out of a category's handle set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteEventKind {
    Skipped,
    Failed,
}

/// A per-site skip or failure surfaced in the run report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEvent {
    pub category: RepositoryCategory,
    pub site_slug: String,
    pub repository_slug: String,
    pub kind: SiteEventKind,
    pub reason: String,
}

impl fmt::Display for SiteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SiteEventKind::Skipped => "skipped",
            SiteEventKind::Failed => "failed",
        };
        write!(
            f,
            "[{}] site {} ({}) {}: {}",
            self.category, self.site_slug, self.repository_slug, kind, self.reason
        )
    }
}

/// Final report of a job run, returned to the invocation surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub kind: JobKind,
    pub commit: bool,
    pub state: JobState,
    pub history: Vec<JobState>,
    pub sites: Vec<Site>,
    pub events: Vec<SiteEvent>,
    pub publish_records: Vec<PublishRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance: Option<ComplianceResult>,
    pub artifact_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }

    /// Human-readable per-site / per-repository log lines
    pub fn log_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.events.iter().map(ToString::to_string).collect();
        for record in &self.publish_records {
            if let PublishOutcome::Failed { reason } = &record.outcome {
                lines.push(format!(
                    "[{}] repository {} publish failed: {}",
                    record.repository.category,
                    record.repository.slug(),
                    reason
                ));
            }
        }
        lines
    }
}
