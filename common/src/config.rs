// Configuration management with layered configuration (file, env)

use crate::models::RepositoryRef;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub worker: WorkerConfig,
    pub inventory: InventoryConfig,
    pub repositories: Vec<RepositoryRef>,
    pub services: ServicesConfig,
    pub git: GitConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Site-level sync tasks allowed in flight at once
    pub concurrency: u32,
    pub fetch_timeout_seconds: u64,
    pub push_timeout_seconds: u64,
    pub compute_timeout_seconds: u64,
    /// Retries granted to a transient transport failure
    pub transient_retries: u32,
    pub retry_delay_ms: u64,
}

impl WorkerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_seconds)
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub compliance_url: String,
    pub rendering_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub binary: String,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("GCJ")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.worker.concurrency == 0 {
            return Err("Worker concurrency must be greater than 0".to_string());
        }
        if self.worker.fetch_timeout_seconds == 0 || self.worker.push_timeout_seconds == 0 {
            return Err("Worker fetch/push timeouts must be greater than 0".to_string());
        }
        if self.worker.transient_retries > 1 {
            return Err("Transient failures may be retried at most once".to_string());
        }

        if self.inventory.path.is_empty() {
            return Err("Inventory path cannot be empty".to_string());
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.slug.is_empty() {
                return Err("Repository slug cannot be empty".to_string());
            }
            if repo.remote_url.is_empty() {
                return Err(format!("Repository '{}' has no remote URL", repo.slug));
            }
            if !seen.insert(repo.slug.as_str()) {
                return Err(format!("Repository '{}' configured twice", repo.slug));
            }
        }

        if self.services.compliance_url.is_empty() || self.services.rendering_url.is_empty() {
            return Err("Compliance and rendering service URLs cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            inventory: InventoryConfig::default(),
            repositories: Vec::new(),
            services: ServicesConfig::default(),
            git: GitConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            fetch_timeout_seconds: 120,
            push_timeout_seconds: 120,
            compute_timeout_seconds: 1800,
            transient_retries: 1,
            retry_delay_ms: 2000,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: "inventory.json".to_string(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            compliance_url: "http://localhost:8081".to_string(),
            rendering_url: "http://localhost:8082".to_string(),
            timeout_seconds: 600,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            author_name: "Golden Config Jobs".to_string(),
            author_email: "golden-config@localhost".to_string(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}
