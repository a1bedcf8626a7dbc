//! availflow - load vaccine availability from every configured source
//!
//! Usage:
//!   availflow [SOURCES...] [--send] [--compact] [--states NJ,NY]
//!   availflow --server [--port 3010]
//!
//! Records are printed to stdout as JSON unless `--send` is given, in which
//! case they are posted to the API at `API_URL`. With `--server`, sources are
//! run on each `POST /` instead (see `availflow::server`).
//!
//! Exit codes:
//!   0  - every source succeeded
//!   91 - some sources failed
//!   92 - no source succeeded
//!   90 - unhandled error (bad configuration, ...)

use anyhow::{Context, Result};
use availflow::config::ConfigError;
use availflow::delivery::{ApiClient, UpdateQueue};
use availflow::logging;
use availflow::metrics::LogMetrics;
use availflow::pipeline::{ConsoleSink, ExitStatus, Orchestrator, RunOptions, SourceRegistry};
use availflow::server::{self, LoadRequest, OrchestratorFactory};
use availflow::smart::HttpFetcher;
use availflow::sources::default_registry;
use availflow::stale::StaleChecker;
use availflow::LoaderConfig;
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "availflow", about = "Load vaccine appointment availability")]
struct Cli {
    /// Sources to load (default: all)
    sources: Vec<String>,

    /// Send availability info to the API specified by `API_URL`
    #[arg(long)]
    send: bool,

    /// Output one JSON object per line instead of pretty-printing
    #[arg(long)]
    compact: bool,

    /// Comma-separated list of state abbreviations to load
    #[arg(long, value_delimiter = ',')]
    states: Vec<String>,

    /// List available sources and exit
    #[arg(long)]
    list: bool,

    /// Run sources on each POST request instead of once
    #[arg(long)]
    server: bool,

    /// Port to listen on in server mode
    #[arg(long, env = "PORT", default_value_t = server::DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            logging::init(false);
            error!("❌ {:#}", e);
            ExitCode::from(ExitStatus::Unhandled.code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config = LoaderConfig::from_env().context("invalid configuration")?;
    logging::init(config.debug);

    let fetcher = HttpFetcher::new(config.http_timeout, &config.user_agent())
        .context("could not build HTTP client")?;
    let registry = default_registry(Arc::new(fetcher));

    if cli.list {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(ExitStatus::Success);
    }

    if cli.server {
        return run_server(config, registry, cli.port).await;
    }

    let states: Vec<String> = cli
        .states
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    info!("🚀 availflow {}", config.version);
    info!("   ├─ Sources: {}", if cli.sources.is_empty() { "all".to_string() } else { cli.sources.join(", ") });
    info!("   ├─ States: {}", if states.is_empty() { "all".to_string() } else { states.join(", ") });
    info!("   └─ Output: {}", if cli.send { config.api_url.as_deref().unwrap_or("API") } else { "stdout" });

    let orchestrator =
        build_orchestrator(&config, registry, cli.send, cli.compact).context("cannot send updates")?;

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Received Ctrl+C, cancelling sources...");
            cancel.cancel();
        }
    });

    let summary = orchestrator
        .run(RunOptions {
            sources: cli.sources,
            states: if states.is_empty() { None } else { Some(states) },
            timeout: config.run_timeout,
        })
        .await;

    if summary.status != ExitStatus::Success {
        let failed: Vec<&str> = summary.failed_sources().map(|r| r.name.as_str()).collect();
        warn!("⚠️  Failed sources: {}", failed.join(", "));
    }

    Ok(summary.status)
}

fn build_orchestrator(
    config: &LoaderConfig,
    registry: SourceRegistry,
    send: bool,
    compact: bool,
) -> Result<Orchestrator, ConfigError> {
    let checker = StaleChecker::new(Utc::now(), config.stale_threshold_ms);
    let orchestrator = Orchestrator::new(registry, checker, Arc::new(LogMetrics::new()));

    if send {
        let client = ApiClient::from_config(config)?;
        let queue = UpdateQueue::new(Arc::new(client), config.api_concurrency);
        Ok(orchestrator.with_queue(Arc::new(queue)))
    } else {
        Ok(orchestrator.with_sink(Arc::new(ConsoleSink::stdout(compact))))
    }
}

async fn run_server(config: LoaderConfig, registry: SourceRegistry, port: u16) -> Result<ExitStatus> {
    info!("🚀 availflow {} (server mode)", config.version);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("could not bind to port {}", port))?;

    let run_timeout = config.run_timeout;
    let factory: OrchestratorFactory = Arc::new(move |request: &LoadRequest| {
        build_orchestrator(&config, registry.clone(), request.send, true)
    });

    server::serve(listener, factory, run_timeout, shutdown_signal())
        .await
        .context("server error")?;
    Ok(ExitStatus::Success)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("⚠️  Could not listen for Ctrl+C: {}", e);
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("⚠️  Could not listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
