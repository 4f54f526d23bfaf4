//! CLI definitions for the job worker

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::models::{FilterField, JobKind, JobRequest, SiteFilterCriteria};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "worker",
    version,
    about = "Runs golden configuration jobs against a filtered site population"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding default.toml and local.toml
    #[arg(long, global = true, env = "GCJ_CONFIG_DIR", default_value = "config")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Refresh backup and intended repositories
    Refresh {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Compute configuration compliance
    Compliance {
        #[command(flatten)]
        job: JobArgs,

        /// Refresh backup and intended repositories before diffing
        #[arg(long)]
        refresh_repos: bool,
    },

    /// Render intended configurations and optionally publish them
    Intended {
        #[command(flatten)]
        job: JobArgs,
    },
}

/// Filter and mode flags shared by every job
#[derive(Args, Debug, Default)]
pub struct JobArgs {
    /// Commit and push results (dry run otherwise)
    #[arg(long)]
    pub commit: bool,

    /// JSON file with site filter criteria; flags below are merged into it
    #[arg(long)]
    pub criteria: Option<PathBuf>,

    #[arg(long = "tenant-group")]
    pub tenant_group: Vec<String>,
    #[arg(long)]
    pub tenant: Vec<String>,
    #[arg(long)]
    pub region: Vec<String>,
    #[arg(long)]
    pub site: Vec<String>,
    #[arg(long = "rack-group")]
    pub rack_group: Vec<String>,
    #[arg(long)]
    pub rack: Vec<String>,
    #[arg(long)]
    pub role: Vec<String>,
    #[arg(long)]
    pub manufacturer: Vec<String>,
    #[arg(long)]
    pub platform: Vec<String>,
    #[arg(long = "device-type")]
    pub device_type: Vec<String>,
    #[arg(long)]
    pub device: Vec<String>,
    #[arg(long)]
    pub tag: Vec<String>,

    /// Log per-site progress at info level
    #[arg(long)]
    pub debug: bool,
}

impl JobArgs {
    fn flag_values(&self, field: FilterField) -> &[String] {
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

    /// Criteria file (if any) with command-line values appended per field
    pub fn criteria(&self) -> Result<SiteFilterCriteria> {
        let mut criteria = match &self.criteria {
            Some(path) => load_criteria(path)?,
            None => SiteFilterCriteria::default(),
        };
        for field in FilterField::ALL {
            criteria
                .values_mut(field)
                .extend(self.flag_values(field).iter().cloned());
        }
        criteria.debug |= self.debug;
        Ok(criteria)
    }
}

fn load_criteria(path: &Path) -> Result<SiteFilterCriteria> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read criteria file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid criteria file {}", path.display()))
}

impl Cli {
    /// Translate the parsed command line into a job request
    pub fn job_request(&self) -> Result<JobRequest> {
        let request = match &self.command {
            Command::Refresh { job } => {
                JobRequest::new(JobKind::RefreshOnly, job.criteria()?, job.commit)
            }
            Command::Compliance { job, refresh_repos } => {
                JobRequest::new(JobKind::Compliance, job.criteria()?, job.commit)
                    .with_refresh_repos(*refresh_repos)
            }
            Command::Intended { job } => {
                JobRequest::new(JobKind::IntendedGeneration, job.criteria()?, job.commit)
            }
        };
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_intended_with_commit() {
        let cli = Cli::try_parse_from(["worker", "intended", "--commit", "--site", "nyc"]).unwrap();
        let request = cli.job_request().unwrap();

        assert_eq!(request.kind, JobKind::IntendedGeneration);
        assert!(request.commit);
        assert_eq!(request.criteria.site, vec!["nyc".to_string()]);
        assert_eq!(cli.config, PathBuf::from("config"));
    }

    #[test]
    fn test_parse_compliance_refresh_flag() {
        let cli = Cli::try_parse_from(["worker", "compliance", "--refresh-repos"]).unwrap();
        let request = cli.job_request().unwrap();

        assert_eq!(request.kind, JobKind::Compliance);
        assert!(request.refresh_repos);
        assert!(!request.commit);
        assert!(request.criteria.is_unconstrained());
    }

    #[test]
    fn test_refresh_does_not_accept_refresh_repos() {
        assert!(Cli::try_parse_from(["worker", "refresh", "--refresh-repos"]).is_err());
    }

    #[test]
    fn test_repeated_flags_accumulate() {
        let cli = Cli::try_parse_from([
            "worker",
            "refresh",
            "--region",
            "emea",
            "--region",
            "apac",
            "--tenant-group",
            "retail",
            "--debug",
        ])
        .unwrap();
        let criteria = cli.job_request().unwrap().criteria;

        assert_eq!(criteria.region, vec!["emea".to_string(), "apac".to_string()]);
        assert_eq!(criteria.tenant_group, vec!["retail".to_string()]);
        assert!(criteria.debug);
    }

    #[test]
    fn test_criteria_file_merged_with_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"site": ["nyc"], "role": ["edge"]}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from(["worker", "refresh", "--criteria", &path, "--site", "lon"])
            .unwrap();
        let criteria = cli.job_request().unwrap().criteria;

        assert_eq!(criteria.site, vec!["nyc".to_string(), "lon".to_string()]);
        assert_eq!(criteria.role, vec!["edge".to_string()]);
    }

    #[test]
    fn test_missing_criteria_file_is_an_error() {
        let cli = Cli::try_parse_from([
            "worker",
            "refresh",
            "--criteria",
            "/nonexistent/criteria.json",
        ])
        .unwrap();
        assert!(cli.job_request().is_err());
    }
}
