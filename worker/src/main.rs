// Worker binary entry point: runs one golden-config job and exits

mod cli;

use anyhow::Result;
use clap::Parser;
use common::config::Settings;
use common::filter::SiteFilter;
use common::inventory::JsonInventory;
use common::publish::PublishStep;
use common::retry::{ExponentialBackoff, RetryStrategy};
use common::runner::JobRunner;
use common::services::{HttpComplianceService, HttpRenderingService};
use common::sync::RepositorySync;
use common::telemetry;
use common::vcs::{GitCli, RepositoryCatalog, VersionControl};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RETRY_JITTER: f64 = 0.1;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = cli::Cli::parse();

    let settings = Settings::load_from_path(&cli.config)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let request = cli.job_request()?;
    info!(kind = %request.kind, commit = request.commit, "Starting golden config job");

    let runner = build_runner(&settings).await.map_err(|e| {
        error!(error = %e, "Failed to initialize job runner");
        e
    })?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, finishing in-flight work");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let report = runner.run(request, cancel).await;

    for line in report.log_lines() {
        warn!("{}", line);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!(
        run_id = %report.run_id,
        state = %report.state,
        "Golden config job finished"
    );
    telemetry::shutdown_tracer();

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn build_runner(settings: &Settings) -> Result<JobRunner> {
    let inventory = JsonInventory::load(&settings.inventory.path).await?;
    let catalog = Arc::new(RepositoryCatalog::new(settings.repositories.clone()));
    info!(repositories = catalog.len(), "Repository catalog loaded");

    let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::from_config(&settings.git));
    let retry: Arc<dyn RetryStrategy> = Arc::new(ExponentialBackoff::with_config(
        settings.worker.retry_delay_ms,
        MAX_RETRY_DELAY_MS.max(settings.worker.retry_delay_ms),
        RETRY_JITTER,
        settings.worker.transient_retries,
    ));

    let compliance = HttpComplianceService::new(
        settings.services.compliance_url.clone(),
        settings.services.timeout_seconds,
    )?;
    let rendering = HttpRenderingService::new(
        settings.services.rendering_url.clone(),
        settings.services.timeout_seconds,
    )?;

    let sync = RepositorySync::new(catalog, Arc::clone(&vcs), Arc::clone(&retry))
        .with_fetch_timeout(settings.worker.fetch_timeout())
        .with_concurrency(settings.worker.concurrency as usize);
    let publish = PublishStep::new(vcs, retry).with_push_timeout(settings.worker.push_timeout());

    Ok(JobRunner::new(
        SiteFilter::new(Arc::new(inventory)),
        sync,
        publish,
        Arc::new(compliance),
        Arc::new(rendering),
    )
    .with_compute_timeout(settings.worker.compute_timeout()))
}
