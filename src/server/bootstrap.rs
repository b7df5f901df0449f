use crate::config::types::OrchestratorConfig;
use crate::config::validate as config_validate;
use crate::events::{Event, EventBus, EventHandler};
use crate::live::api::ApiState;
use crate::live::service::LiveValidator;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::server;
use crate::validate::enhanced::EnhancedValidator;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Exit codes: 0 success, 1 configuration or runtime failure. Usage errors
/// exit with 2 through clap.
pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen: Option<String>,
}

pub fn init_tracing(default_level: &str) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(64_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(guard);
}

/// Load the config and abort with the full report when it is invalid.
fn load_validated_config(path: &PathBuf) -> Result<Option<OrchestratorConfig>> {
    let config = OrchestratorConfig::load(path)?;
    let report = config_validate::validate(&config);
    if !report.is_valid() {
        eprintln!("configuration invalid:\n{}", report.format());
        return Ok(None);
    }
    if !report.warnings.is_empty() {
        for warning in &report.warnings {
            tracing::warn!("config: {}", warning);
        }
    }
    Ok(Some(config))
}

/// `validate` command: configuration validation, plus the enhanced pass when
/// connectivity checks are enabled in config.
pub async fn run_validate(args: BootstrapArgs) -> Result<i32> {
    let config = OrchestratorConfig::load(&args.config_path)?;
    let report = config_validate::validate(&config);
    print!("{}", report.format());
    if !report.is_valid() {
        return Ok(EXIT_FAILURE);
    }

    let validator = EnhancedValidator::new(&config.validation);
    let result = validator.validate(&config).await;
    println!(
        "enhanced validation: {} ({} clusters, {} valid, {} invalid, {}ms)",
        if result.valid { "valid" } else { "invalid" },
        result.summary.total_clusters,
        result.summary.valid_clusters,
        result.summary.invalid_clusters,
        result.duration_ms,
    );
    for (name, cluster) in &result.cluster_results {
        for error in &cluster.errors {
            println!("  {}: error: {}", name, error);
        }
        for warning in &cluster.warnings {
            println!("  {}: warning: {}", name, warning);
        }
    }
    for warning in &result.global_warnings {
        println!("  warning: {}", warning);
    }

    Ok(if result.valid { EXIT_OK } else { EXIT_FAILURE })
}

/// `backup` command: one orchestrated multi-cluster run.
pub async fn run_backup(args: BootstrapArgs) -> Result<i32> {
    init_tracing("info");
    let Some(config) = load_validated_config(&args.config_path)? else {
        return Ok(EXIT_FAILURE);
    };

    // Pre-flight enhanced validation; connectivity probes run when enabled.
    let validator = EnhancedValidator::new(&config.validation);
    let validation = validator.validate(&config).await;
    if !validation.valid {
        for error in &validation.global_errors {
            tracing::error!("validation: {}", error);
        }
        for (name, cluster) in &validation.cluster_results {
            for error in &cluster.errors {
                tracing::error!("validation: cluster={}: {}", name, error);
            }
        }
        eprintln!("pre-flight validation failed");
        return Ok(EXIT_FAILURE);
    }

    let bus = Arc::new(EventBus::new());
    subscribe_log_handlers(&bus);
    let orchestrator = Orchestrator::new(config, bus).await?;

    match orchestrator.execute_backup().await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(EXIT_OK)
        }
        Err(run_error) => {
            tracing::error!("backup run failed: {}", run_error);
            if let Some(result) = &run_error.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            Ok(EXIT_FAILURE)
        }
    }
}

/// `serve` command lifecycle: init → validate → compose → watch → serve →
/// drain.
pub async fn run_serve(args: BootstrapArgs) -> Result<i32> {
    // Phase 1: configuration.
    let config = OrchestratorConfig::load(&args.config_path)?;
    init_tracing(&config.observability.log_level);
    let report = config_validate::validate(&config);
    if !report.is_valid() {
        eprintln!("configuration invalid:\n{}", report.format());
        return Ok(EXIT_FAILURE);
    }

    let metrics = Metrics::install();
    let listen = args
        .listen
        .unwrap_or_else(|| config.live.listen.clone());

    // Phase 2: composition. The orchestrator validates again (fail-fast) and
    // builds registry, executors and breakers.
    let bus = Arc::new(EventBus::new());
    subscribe_log_handlers(&bus);
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), bus.clone()).await?);

    // Phase 3: background loops, all owned here.
    let shutdown = Arc::new(Notify::new());
    let registry = orchestrator.registry();
    let registry_task = tokio::spawn(async move { registry.run().await });

    let live = Arc::new(LiveValidator::new(config, bus.clone()));
    live.start();

    // Phase 4: the API server.
    let api_state = ApiState {
        live: live.clone(),
        metrics,
    };
    let server_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let listen = listen.clone();
        async move { server::run_api_server(&listen, api_state, shutdown).await }
    });

    tracing::info!("server: ready, listen={}", listen);

    // Phase 5: block until signal, then drain.
    wait_for_shutdown().await;
    shutdown.notify_waiters();

    live.stop().await;
    if let Err(e) = orchestrator.shutdown(SHUTDOWN_DRAIN).await {
        tracing::error!("server: shutdown drain incomplete: {}", e);
    }
    if let Err(e) = registry_task.await {
        tracing::error!("server: registry task error: {}", e);
    }
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: API server error: {}", e),
        Err(e) => tracing::error!("server: API task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(EXIT_OK)
}

/// Operational visibility: key topics logged as they fire.
fn subscribe_log_handlers(bus: &EventBus) {
    let log_info: EventHandler = Arc::new(|event: Event| {
        Box::pin(async move {
            tracing::info!("event: {} {}", event.topic, event.payload);
            Ok(())
        })
    });
    let log_warn: EventHandler = Arc::new(|event: Event| {
        Box::pin(async move {
            tracing::warn!("event: {} {}", event.topic, event.payload);
            Ok(())
        })
    });

    for topic in ["backup_started", "backup_completed", "validation_completed"] {
        bus.subscribe(topic, log_info.clone());
    }
    for topic in [
        "backup_failed",
        "validation_failed",
        "cluster_unreachable",
        "health_check_failed",
    ] {
        bus.subscribe(topic, log_warn.clone());
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
