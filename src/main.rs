//! Application entry point for the `codemetal-stationalert` service.
//!
//! This binary orchestrates the full startup sequence for the alert engine,
//! including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Loading stations, parameters and rule versions into memory
//! - Starting the upstream station poller when configured
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving until Ctrl-C
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `APP_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `APP_SPAN_EVENTS` (optional) – span event mode for tracing
//! - see `config.rs` for the remaining tunables
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use codemetal_stationalert::calibration::RegistryCalibrator;
use codemetal_stationalert::notify::LogSink;
use codemetal_stationalert::registry::Registry;
use codemetal_stationalert::rules::RuleStore;
use codemetal_stationalert::source::StationApiSource;
use codemetal_stationalert::storage::PgStore;
use codemetal_stationalert::{config, routes, schema, AlertEngine};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", cfg.masked_db_url());

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database '{}': {}",
                cfg.masked_db_url(),
                e
            )
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let registry = Arc::new(Registry::new());
    let rules = Arc::new(RuleStore::unloaded(Arc::clone(&registry)));
    store.load_catalog().await?.install(&registry, &rules)?;

    let engine = Arc::new(AlertEngine::new(
        Arc::clone(&registry),
        rules,
        store,
        Arc::new(RegistryCalibrator::new(registry)),
        Arc::new(LogSink),
        cfg.ingest_limits(),
    ));

    let shutdown = CancellationToken::new();
    let poller = cfg.station_api_url.clone().map(|url| {
        let source = StationApiSource::new(url, cfg.api_max_pages);
        tokio::spawn(source.run(
            Arc::clone(&engine),
            cfg.poll_interval(),
            shutdown.clone(),
        ))
    });

    // Build app from routes gateway (EMBP)
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let app: Router = routes::router(engine, cfg);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    pool.close().await;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `APP_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, falling back to `APP_LOG_LEVEL`
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("APP_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("APP_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,hyper=info,reqwest=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
