use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Instrument, Level};

use tally_core::events::LifecycleEvent;
use tally_core::gateway::ReportingGateway;
use tally_core::ids::SessionId;
use tally_engine::{MockGateway, Reporter, ReporterOptions};
use tally_gateway::HttpGateway;
use tally_settings::{load_settings_from_path, settings_path, ValidatedSettings};
use tally_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "tally", version, about = "Report test lifecycle events to a tracking service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read lifecycle events as JSON lines from stdin and report them.
    Run {
        /// Settings file (default: ~/.tally/settings.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Process events without contacting the service.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, dry_run } => run(config, dry_run).await,
    }
}

async fn run(config: Option<PathBuf>, dry_run: bool) -> anyhow::Result<()> {
    let path = config.unwrap_or_else(settings_path);
    let mut raw = load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    if dry_run {
        raw.enabled = false;
    }
    let settings = raw.validate().context("invalid settings")?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: settings.logging.level.parse().unwrap_or(Level::INFO),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.persist_warnings,
        ..Default::default()
    });

    let gateway: Arc<dyn ReportingGateway> = match &settings.connection {
        Some(connection) => {
            info!(endpoint = %connection.endpoint, project = %connection.project, "reporting enabled");
            Arc::new(HttpGateway::new(connection)?)
        }
        None => {
            info!(dry_run, "reporting disabled, events are recorded in memory only");
            Arc::new(MockGateway::new())
        }
    };

    let reporter = Reporter::new(gateway, reporter_options(&settings))?;
    let session_id = reporter.session_id();
    let span = tracing::info_span!("tally_run", session_id = %session_id);

    let events = consume_stdin(&reporter).instrument(span).await?;
    reporter.flush().await;

    let coordinator = reporter.coordinator();
    if coordinator.bundle_count() > 0 {
        warn!(
            open_bundles = coordinator.bundle_count(),
            "input ended with bundles still open, session left unfinished"
        );
    }

    let stats = reporter.stats();
    let summary = serde_json::json!({
        "sessionId": session_id.as_str(),
        "status": coordinator.aggregated_status(),
        "finalized": coordinator.is_finalized(),
        "events": events,
        "itemsCreated": stats.items_created,
        "itemsFinished": stats.items_finished,
        "gatewayFailures": stats.gateway_failures,
        "registryTimeouts": stats.registry_timeouts,
        "logsPosted": stats.logs_posted,
        "peakOperations": reporter.peak_operations(),
    });
    println!("{summary}");

    if let Some(logs) = telemetry.logs() {
        match logs.count() {
            Ok(n) if n > 0 => info!(warnings = n, "warnings persisted to the log database"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read the log database"),
        }
    }
    Ok(())
}

fn reporter_options(settings: &ValidatedSettings) -> ReporterOptions {
    let limits = &settings.limits;
    ReporterOptions {
        session_name: settings.session.name.clone(),
        session_id: settings.session.id.clone().map(SessionId::from_raw),
        session_attributes: settings.session.attributes.clone(),
        max_recommended_concurrency: limits.max_recommended_concurrency,
        call_timeout: limits.call_timeout(),
        ready_timeout: limits.ready_timeout(),
        ready_poll_interval: limits.ready_poll_interval(),
        drain_timeout: limits.drain_timeout(),
    }
}

/// Dispatch every well-formed line. Returns the number of events accepted.
async fn consume_stdin(reporter: &Reporter) -> anyhow::Result<usize> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0usize;
    let mut accepted = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LifecycleEvent>(&line) {
            Ok(event) => {
                reporter.dispatch(event);
                accepted += 1;
            }
            Err(e) => warn!(line = line_no, error = %e, "skipping malformed event"),
        }
    }
    Ok(accepted)
}
