//! Walm worker - hosts the release and project task handlers

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walm_kube::{
    ChartProcessor, KubeCluster, LocalTaskRunner, ManifestApplier, PluginRegistry, ProjectManager,
    ReleaseManager, ReleaseStore, SecretsBackend, StoreBackend, WalmConfig,
};
use walm_repo::RepoChartSource;

mod error;

use error::{Result, WorkerError};

#[derive(Parser)]
#[command(name = "walm-worker")]
#[command(version)]
#[command(about = "Runs Walm release and project tasks against the current cluster", long_about = None)]
struct Cli {
    /// Configuration file (defaults apply when omitted)
    #[arg(short, long, env = "WALM_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Reload every cached release on this period, e.g. "5m"
    #[arg(long, value_parser = humantime_duration)]
    resync: Option<Duration>,
}

fn humantime_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn init_logging(config: &WalmConfig, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .map_err(|e| WorkerError::Logging {
            message: e.to_string(),
        })?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if json || config.log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| WorkerError::Logging {
        message: e.to_string(),
    })
}

fn load_config(path: Option<&PathBuf>) -> Result<WalmConfig> {
    match path {
        Some(path) => WalmConfig::load(path).map_err(|e| {
            WorkerError::config_with_help(
                e.to_string(),
                "every section is optional, an empty file selects the defaults",
            )
        }),
        None => Ok(WalmConfig::default()),
    }
}

async fn build(config: WalmConfig) -> Result<(ReleaseManager, ProjectManager)> {
    if config.task.concurrency == 0 || config.task.project_concurrency == 0 {
        return Err(WorkerError::config(
            "task.concurrency and task.projectConcurrency must be at least 1",
        ));
    }

    let cluster = KubeCluster::try_default(config.kube.client_cache_capacity)
        .await
        .map_err(|e| WorkerError::Cluster {
            message: e.to_string(),
        })?;

    let store = match config.store.backend {
        StoreBackend::Memory => {
            warn!("using the in-memory release store, state is lost on restart");
            ReleaseStore::in_memory()
        }
        StoreBackend::Secrets => ReleaseStore::new(Arc::new(SecretsBackend::new(
            cluster.client().clone(),
            config.store.namespace.clone(),
        ))),
    };

    let cluster = Arc::new(cluster);
    let applier = Arc::new(ManifestApplier::new(cluster.clone(), PluginRegistry::with_defaults()));
    let charts = Arc::new(RepoChartSource::new(config.repository_config()));
    let processor = ChartProcessor::new(charts, cluster.clone(), applier.clone(), store.clone());

    let runner = Arc::new(
        LocalTaskRunner::new(config.task.concurrency, config.task.queue_limit)
            .with_retention(config.task.state_retention),
    );
    let project_runner = Arc::new(
        LocalTaskRunner::new(config.task.project_concurrency, config.task.queue_limit)
            .with_retention(config.task.state_retention),
    );

    let releases = ReleaseManager::new(store, cluster, runner, processor, applier, config);
    let projects = ProjectManager::new(releases.clone(), project_runner);
    releases.register_tasks().await;
    projects.register_tasks().await;
    Ok((releases, projects))
}

/// Re-resolve dependencies of every cached release, upgrading the ones whose inputs moved
async fn resync(releases: &ReleaseManager) {
    let caches = match releases.store().get_release_caches("", "").await {
        Ok(caches) => caches,
        Err(e) => {
            warn!(error = %e, "resync: cannot list release caches");
            return;
        }
    };
    let mut reloaded = 0usize;
    for cache in caches {
        match releases.reload_release(cache.namespace(), cache.name()).await {
            Ok(true) => reloaded += 1,
            Ok(false) => {}
            Err(e) => warn!(
                namespace = cache.namespace(),
                release = cache.name(),
                error = %e,
                "resync: reload failed"
            ),
        }
    }
    info!(reloaded, "resync finished");
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    miette::set_panic_hook();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    init_logging(&config, cli.log_json)?;

    let (releases, _projects) = build(config).await?;
    info!("walm worker started");

    match cli.resync {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => resync(&releases).await,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        None => tokio::signal::ctrl_c().await.map_err(WorkerError::from)?,
    }

    info!("shutting down");
    Ok(())
}
