use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use harvest_core::ids::UserId;
use harvest_engine::pipelines::{EchoPipeline, UnconfiguredPipeline};
use harvest_engine::{BoundedInvoker, Pipeline};
use harvest_server::settings::{self, GatewaySettings, LoggingSettings};
use harvest_server::{ConnectionRegistry, QueryGateway, ShutdownCoordinator, StaticProfiles};
use harvest_telemetry::TelemetryConfig;
use tracing::{info, Level};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PipelineKind {
    /// Reply with the query text.
    Echo,
    /// No backend; every query gets the initializing notice.
    None,
}

#[derive(Debug, Parser)]
#[command(name = "harvest", about = "Real-time query gateway")]
struct Args {
    /// Settings file (defaults to ~/.harvest/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, value_enum, default_value_t = PipelineKind::Echo)]
    pipeline: PipelineKind,

    /// JSON object mapping user ids to profile context.
    #[arg(long)]
    profiles: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings_path = args.settings.clone().unwrap_or_else(settings::settings_path);
    let mut gateway_settings = settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    if let Some(port) = args.port {
        gateway_settings.server.port = port;
    }

    harvest_telemetry::init_telemetry(&telemetry_config(&gateway_settings.logging)?)?;
    info!(settings = %settings_path.display(), "starting harvest gateway");

    let pipeline: Arc<dyn Pipeline> = match args.pipeline {
        PipelineKind::Echo => Arc::new(EchoPipeline),
        PipelineKind::None => Arc::new(UnconfiguredPipeline::new("no pipeline configured")),
    };

    let gateway = build_gateway(&gateway_settings, pipeline, args.profiles.as_deref())?;

    let coordinator = ShutdownCoordinator::new();
    let handle = harvest_server::start(
        gateway_settings.server_config(),
        Arc::clone(&gateway),
        coordinator.token(),
    )
    .await
    .context("starting server")?;

    info!(port = handle.port, "harvest gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    info!("shutdown requested");
    let report = coordinator
        .graceful_shutdown(&gateway, handle.into_tasks(), gateway_settings.drain_timeout())
        .await;
    if !report.drained {
        tracing::warn!("some queries were still running at exit");
    }
    Ok(())
}

fn build_gateway(
    settings: &GatewaySettings,
    pipeline: Arc<dyn Pipeline>,
    profiles: Option<&Path>,
) -> anyhow::Result<Arc<QueryGateway>> {
    let invoker = Arc::new(BoundedInvoker::new(settings.invoker_config()));
    let mut gateway = QueryGateway::new(Arc::new(ConnectionRegistry::new()), invoker, pipeline);
    if let Some(path) = profiles {
        let profiles = load_profiles(path)?;
        info!(count = profiles.len(), "loaded user profiles");
        gateway = gateway.with_profiles(Arc::new(StaticProfiles::new(profiles)));
    }
    Ok(Arc::new(gateway))
}

fn load_profiles(path: &Path) -> anyhow::Result<HashMap<UserId, serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading profiles from {}", path.display()))?;
    let raw: HashMap<String, serde_json::Value> =
        serde_json::from_str(&content).context("parsing profiles")?;
    Ok(raw
        .into_iter()
        .map(|(user, profile)| (UserId::from_raw(user), profile))
        .collect())
}

fn telemetry_config(logging: &LoggingSettings) -> anyhow::Result<TelemetryConfig> {
    let log_level = parse_level(&logging.level)?;
    let module_levels = logging
        .modules
        .iter()
        .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(TelemetryConfig {
        log_level,
        module_levels,
        json: logging.json,
    })
}

fn parse_level(level: &str) -> anyhow::Result<Level> {
    level
        .parse::<Level>()
        .map_err(|_| anyhow::anyhow!("invalid log level: {level}"))
}
