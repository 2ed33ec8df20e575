// GTFS insights server: feed statistics, demand forecasting and transit Q&A

use anyhow::{Context, Result};
use clap::Parser;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use gtfs_insights::chat::{ChatHistory, GeminiClient, QueryResponder, ReadOnlyDatabase};
use gtfs_insights::config::{Cli, Command, Settings};
use gtfs_insights::demand::{ModelStore, TrainingOptions, build_feature_table, train};
use gtfs_insights::feed::Feed;
use gtfs_insights::mirror::build_mirror;
use gtfs_insights::server::{AppState, run_server};
use gtfs_insights::service_clock::parse_service_date;

// ============================================================================
// Logging
// ============================================================================

/// Coloured stderr output plus a JSON file that rolls daily. The returned guard must
/// live as long as the process so buffered file output is flushed.
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_insights.log".to_string());
    let log_dir = Path::new(&log_file_path).parent().unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_insights.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_filter = EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug"));

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_writer(non_blocking_file)
        .with_filter(json_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

// ============================================================================
// Commands
// ============================================================================

fn load_feed(settings: &Settings) -> Result<Feed> {
    info!(path = %settings.gtfs_path.display(), units = ?settings.dist_units, "Loading GTFS feed");
    Feed::load(&settings.gtfs_path, settings.dist_units)
        .with_context(|| format!("failed to load GTFS feed from {}", settings.gtfs_path.display()))
}

fn serve(settings: Settings) -> Result<()> {
    let feed = load_feed(&settings)?;
    let models = ModelStore::open(&settings.artifact_dir);

    let llm = GeminiClient::new(settings.gemini()).context("failed to configure the language model client")?;
    if settings.gemini_api_key.is_none() {
        info!("GEMINI_API_KEY is not set; /chat_query will report errors");
    }
    if !settings.sqlite_path.exists() {
        info!(
            path = %settings.sqlite_path.display(),
            "SQLite mirror not found; run `build-db` before using /chat_query"
        );
    }
    let chat = QueryResponder::new(
        Arc::new(llm),
        ReadOnlyDatabase::new(
            &settings.sqlite_path,
            settings.sql_timeout(),
            settings.sql_row_limit,
        ),
        ChatHistory::new(settings.history()),
        settings.responder(),
    );

    let state = AppState::new(feed, models, chat);
    actix_web::rt::System::new()
        .block_on(run_server(state, &settings.bind_addr, settings.port))
        .context("HTTP server failed")
}

fn build_db(settings: &Settings, start_date: &str, end_date: &str) -> Result<()> {
    let start = parse_service_date(start_date)?;
    let end = parse_service_date(end_date)?;
    let feed = load_feed(settings)?;
    let summary = build_mirror(&feed, &settings.sqlite_path, start, end)?;
    info!(
        path = %settings.sqlite_path.display(),
        agencies = summary.agencies,
        route_stat_rows = summary.route_stat_rows,
        dates = summary.dates,
        "SQLite mirror ready"
    );
    Ok(())
}

fn train_offline(settings: &Settings) -> Result<()> {
    let feed = load_feed(settings)?;
    let rows = build_feature_table(&feed);
    let bundle = train(&rows, TrainingOptions::default())?;
    let store = ModelStore::open(&settings.artifact_dir);
    let installed = store.install(bundle)?;
    let report = installed.report();
    info!(
        bundle_id = %report.bundle_id,
        mse = report.mse,
        mae = report.mae,
        dir = %settings.artifact_dir.display(),
        "Demand model trained"
    );
    for feature in report.feature_importance.iter().take(5) {
        info!(feature = %feature.feature, importance = feature.importance, "Top feature");
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let cli = Cli::parse();
    let settings = cli.settings;

    let outcome = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings),
        Command::BuildDb { start_date, end_date } => build_db(&settings, &start_date, &end_date),
        Command::Train => train_offline(&settings),
    };

    if let Err(e) = &outcome {
        error!(error = %format!("{:#}", e), "Command failed");
    }
    outcome
}
