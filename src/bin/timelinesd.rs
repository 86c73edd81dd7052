//! Collector daemon.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`TIMELINES_*`), and CLI flags. Opens the collector, replays the backing log, serves
//! health/readiness/stats endpoints, and runs until graceful shutdown (SIGINT/SIGTERM).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use std::convert::Infallible;

use bytes::Bytes;
use clap::Parser;
use config::{Config, Environment, File};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use timelines::telemetry::TracingEventListener;
use timelines::{Collector, CollectorConfig, ShutdownMode};

// ---------- CLI ----------

/// Metrics collector ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "timelinesd", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `./timelinesd.toml` is loaded when present.
    #[arg(long, env = "TIMELINES_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override data directory (backing log and catalog).
    #[arg(long, env = "TIMELINES_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// HTTP listen address for health/readiness/stats endpoints (e.g. 127.0.0.1:8080).
    #[arg(long, env = "TIMELINES_HTTP_BIND")]
    pub http_bind: Option<String>,
}

// ---------- File/env config (all optional for partial config) ----------

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    pub http_bind: Option<String>,
    /// `tracing` filter directive used when `RUST_LOG` is unset (e.g. "info,timelines=debug").
    pub log_level: Option<String>,
    pub data_dir: Option<String>,
    pub chunk_length_secs: Option<u64>,
    pub background_writes: Option<bool>,
    pub write_batch_size: Option<usize>,
    pub max_write_delay_secs: Option<u64>,
    pub write_check_interval_ms: Option<u64>,
    pub aggregation_enabled: Option<bool>,
    pub aggregation_interval_secs: Option<u64>,
    pub chunks_to_aggregate: Option<Vec<usize>>,
    pub max_aggregation_level: Option<u8>,
    pub delete_aggregated_chunks: Option<bool>,
    /// `"flush"` or `"save_start_times"`.
    pub shutdown_mode: Option<ShutdownMode>,
    pub shutdown_grace_period_secs: Option<u64>,
    pub drain_poll_interval_ms: Option<u64>,
    pub periodic_commit: Option<bool>,
    pub commit_interval_secs: Option<u64>,
    pub persist_catalog: Option<bool>,
    pub deadline_seed: Option<u64>,
}

/// Runtime options for the daemon derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Address to bind the HTTP health/readiness server.
    pub http_bind: SocketAddr,
    pub log_level: String,
}

const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

/// Parse `http_bind` string to `SocketAddr`. Returns error message on failure.
fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
    s.parse::<SocketAddr>()
        .map_err(|e| format!("invalid http_bind {:?}: {}", s, e))
}

/// Load merged config and daemon options. CLI overrides file/env for both.
fn load_daemon_config(cli: &Cli) -> Result<(CollectorConfig, DaemonOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("timelinesd.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("TIMELINES")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("chunks_to_aggregate")
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut config = CollectorConfig {
        event_listener: Arc::new(TracingEventListener),
        ..CollectorConfig::default()
    };
    merge_into_collector_config(&mut config, &partial);

    if let Some(ref d) = cli.data_dir {
        config.data_dir = d.clone();
    }
    config.validate().map_err(|e| e.to_string())?;

    let http_bind_str = cli
        .http_bind
        .as_deref()
        .or(partial.http_bind.as_deref())
        .unwrap_or(DEFAULT_HTTP_BIND);
    let http_bind = parse_http_bind(http_bind_str)?;

    let options = DaemonOptions {
        http_bind,
        log_level: partial.log_level.unwrap_or_else(|| "info".to_string()),
    };
    Ok((config, options))
}

/// Merge file/env partial config onto `CollectorConfig`. Only overwrites fields that are `Some`.
fn merge_into_collector_config(base: &mut CollectorConfig, partial: &DaemonFileConfig) {
    if let Some(s) = &partial.data_dir {
        base.data_dir = PathBuf::from(s);
    }
    if let Some(secs) = partial.chunk_length_secs {
        base.chunk_length = Duration::from_secs(secs);
    }
    if let Some(b) = partial.background_writes {
        base.background_writes = b;
    }
    if let Some(n) = partial.write_batch_size {
        base.write_batch_size = n;
    }
    if let Some(secs) = partial.max_write_delay_secs {
        base.max_write_delay = Duration::from_secs(secs);
    }
    if let Some(ms) = partial.write_check_interval_ms {
        base.write_check_interval = Duration::from_millis(ms);
    }
    if let Some(b) = partial.aggregation_enabled {
        base.aggregation_enabled = b;
    }
    if let Some(secs) = partial.aggregation_interval_secs {
        base.aggregation_interval = Duration::from_secs(secs);
    }
    if let Some(runs) = &partial.chunks_to_aggregate {
        base.chunks_to_aggregate = runs.clone();
    }
    if let Some(n) = partial.max_aggregation_level {
        base.max_aggregation_level = n;
    }
    if let Some(b) = partial.delete_aggregated_chunks {
        base.delete_aggregated_chunks = b;
    }
    if let Some(mode) = partial.shutdown_mode {
        base.shutdown_mode = mode;
    }
    if let Some(secs) = partial.shutdown_grace_period_secs {
        base.shutdown_grace_period = Duration::from_secs(secs);
    }
    if let Some(ms) = partial.drain_poll_interval_ms {
        base.drain_poll_interval = Duration::from_millis(ms);
    }
    if let Some(b) = partial.periodic_commit {
        base.periodic_commit = b;
    }
    if let Some(secs) = partial.commit_interval_secs {
        base.commit_interval = Some(Duration::from_secs(secs));
    }
    if let Some(b) = partial.persist_catalog {
        base.persist_catalog = b;
    }
    if let Some(seed) = partial.deadline_seed {
        base.deadline_seed = Some(seed);
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ---------- Safe startup checks ----------

/// Ensures `data_dir` exists and is writable. Returns an error message on failure.
fn check_data_dir_writable(data_dir: &std::path::Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("data_dir {} cannot be created: {}", data_dir.display(), e))?;
    let marker = data_dir.join(".timelines_write_check");
    std::fs::write(&marker, b"")
        .map_err(|e| format!("data_dir {} not writable: {}", data_dir.display(), e))?;
    let _ = std::fs::remove_file(marker);
    Ok(())
}

// ---------- Health HTTP server ----------

fn render_stats(collector: &Collector) -> String {
    let stats = collector.stats();
    let health = collector.health();
    let h = &stats.handler;
    let w = &stats.writer;
    let a = &stats.aggregation;
    let mut out = String::new();
    let mut line = |key: &str, value: String| {
        out.push_str(key);
        out.push(' ');
        out.push_str(&value);
        out.push('\n');
    };
    line("ready", health.ready.to_string());
    line("events_handled", h.events_handled.to_string());
    line("events_discarded", h.events_discarded.to_string());
    line(
        "events_rejected_after_shutdown",
        h.events_rejected_after_shutdown.to_string(),
    );
    line("samples_rejected", h.samples_rejected.to_string());
    line("replayed_batches", h.replayed_batches.to_string());
    line("accumulators", h.accumulators.to_string());
    line("ack_mismatches", stats.ack_mismatches.to_string());
    line("writer_batches_added", w.batches_added.to_string());
    line("writer_batches_written", w.batches_written.to_string());
    line("writer_chunks_written", w.chunks_written.to_string());
    line("writer_batches_acknowledged", w.batches_acknowledged.to_string());
    line("writer_foreground_writes", w.foreground_writes.to_string());
    line("writer_write_failures", w.write_failures.to_string());
    line("writer_pending_batches", w.pending_batches.to_string());
    line("writer_pending_chunks", w.pending_chunks.to_string());
    line(
        "writer_last_error",
        w.last_error.clone().unwrap_or_else(|| "none".to_string()),
    );
    line("aggregation_passes", a.passes.to_string());
    line("aggregation_ranges_combined", a.ranges_combined.to_string());
    line("aggregation_aggregates_created", a.aggregates_created.to_string());
    line("aggregation_bytes_created", a.bytes_created.to_string());
    line("aggregation_failures", a.failures.to_string());
    out
}

async fn health_service(
    collector: Arc<Collector>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/healthz") => {
            // Liveness: process is alive and responding.
            (hyper::StatusCode::OK, Bytes::from("ok"))
        }
        (&hyper::Method::GET, "/readyz") => {
            // Readiness: backing log replayed and not shutting down.
            if collector.health().ready {
                (hyper::StatusCode::OK, Bytes::from("ok"))
            } else {
                (
                    hyper::StatusCode::SERVICE_UNAVAILABLE,
                    Bytes::from("not ready"),
                )
            }
        }
        (&hyper::Method::GET, "/stats") => {
            (hyper::StatusCode::OK, Bytes::from(render_stats(&collector)))
        }
        _ => (hyper::StatusCode::NOT_FOUND, Bytes::from("not found")),
    };
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    Ok(response)
}

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Runs the daemon: serves HTTP until a shutdown signal, drains connections, then shuts the
/// collector down in its configured mode.
async fn run_with_health_server(
    collector: Arc<Collector>,
    options: DaemonOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(options.http_bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", options.http_bind, e))?;
    tracing::info!(
        data_dir = %collector.config().data_dir.display(),
        http = %options.http_bind,
        "timelinesd running; press Ctrl+C or send SIGTERM to stop"
    );

    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let io = TokioIo::new(Box::pin(stream));
                let collector = Arc::clone(&collector);
                let conn = server.serve_connection_with_upgrades(io, service_fn(move |req| {
                    let collector = Arc::clone(&collector);
                    async move { health_service(collector, req).await }
                }));
                let fut = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        tracing::debug!(error = ?e, "health connection error");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    drop(listener);
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    tokio::select! {
        _ = graceful.shutdown() => {
            tracing::info!("all health connections closed");
        }
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            tracing::warn!("shutdown timeout waiting for connections");
        }
    }

    tracing::info!(mode = ?collector.config().shutdown_mode, "shutting down collector");
    let result = tokio::task::spawn_blocking(move || collector.shutdown()).await?;
    if let Err(e) = result {
        tracing::error!(error = %e, "collector shutdown failed");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

// ---------- Main ----------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (config, options) = load_daemon_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        println!("data_dir={}", config.data_dir.display());
        println!("chunk_length_secs={}", config.chunk_length.as_secs());
        println!("background_writes={}", config.background_writes);
        println!("write_batch_size={}", config.write_batch_size);
        println!("aggregation_enabled={}", config.aggregation_enabled);
        println!(
            "shutdown_mode={}",
            match config.shutdown_mode {
                ShutdownMode::Flush => "flush",
                ShutdownMode::SaveStartTimes => "save_start_times",
            }
        );
        println!("http_bind={}", options.http_bind);
        return Ok(());
    }

    init_logging(&options.log_level);

    // Safe startup: data_dir must exist and be writable before opening the collector.
    check_data_dir_writable(&config.data_dir).map_err(|e| {
        tracing::error!(error = %e, "startup check failed");
        e
    })?;

    let collector = Collector::open(config).map_err(|e| {
        tracing::error!(error = %e, "failed to open collector");
        e
    })?;
    let replayed = collector.replay().map_err(|e| {
        tracing::error!(error = %e, "backing log replay failed");
        e
    })?;
    tracing::info!(replayed, "collector ready");

    run_with_health_server(Arc::new(collector), options).await
}
