//! CLI entry point for the iTranvías poller.
//!
//! Provides subcommands for syncing static data, polling every line for live
//! bus positions, and one-off stop or line lookups.

use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use itranvias_poller::{
    config::Config,
    fetch::BasicClient,
    output::{BusRecord, append_record, append_records, print_json, print_pretty},
    poller::{LivePoller, pause},
    queries,
    store::{EntityStore, Line, LineId, Route, StopId},
    sync::{StaticSync, SyncOptions, Watermark},
    upstream::HttpTransport,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type Transport = HttpTransport<BasicClient>;

#[derive(Parser)]
#[command(name = "itranvias_poller")]
#[command(about = "Mirror and poll the A Coruña city bus network", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch news, stops, lines, routes and fares changed since the last sync
    Sync {
        /// Ignore the stored watermark and fetch everything
        #[arg(long, default_value_t = false)]
        full: bool,

        /// Language for news and names (overrides ITR_LANGUAGE)
        #[arg(short, long)]
        language: Option<String>,

        /// Store topology route ids exactly as the upstream sends them
        #[arg(long, default_value_t = false)]
        raw_route_ids: bool,
    },
    /// Poll every line for live bus positions
    Poll {
        /// Lines to poll (defaults to every known line)
        #[arg(short, long, value_delimiter = ',')]
        lines: Vec<LineId>,

        /// Number of cycles to run (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value_t = 1)]
        num_samples: usize,

        /// Seconds to wait between cycles
        #[arg(short = 'r', long, default_value_t = 60)]
        sample_rate: u64,

        /// CSV file to append one row per bus to
        #[arg(short, long)]
        output: Option<String>,

        /// CSV file to append one row per cycle to
        #[arg(long)]
        stats: Option<String>,
    },
    /// Buses approaching a stop
    Stop {
        #[arg(value_name = "STOP_ID")]
        id: StopId,
    },
    /// Buses along every direction of a line
    Line {
        #[arg(value_name = "LINE_ID")]
        id: LineId,
    },
    /// Stored routes of a line with their stops in order
    Topology {
        #[arg(value_name = "LINE_ID")]
        line: LineId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/itranvias_poller.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("itranvias_poller.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store = EntityStore::open(&config.store_path)
        .with_context(|| format!("opening store at {}", config.store_path))?;
    let transport = HttpTransport::new(BasicClient::new(config.http_timeout)?, &config.base_url)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, stopping");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Commands::Sync {
            full,
            language,
            raw_route_ids,
        } => {
            let stored = if full {
                None
            } else {
                store.read(|t| t.meta().watermark.clone())?
            };
            let language = language.unwrap_or_else(|| config.language.clone());
            let watermark = stored.unwrap_or_default().with_language(language);

            sync(&transport, &store, &config, &watermark, raw_route_ids, &cancel).await?;
        }
        Commands::Poll {
            lines,
            num_samples,
            sample_rate,
            output,
            stats,
        } => {
            poll(
                &transport,
                &store,
                &config,
                lines,
                num_samples,
                Duration::from_secs(sample_rate),
                output.as_deref(),
                stats.as_deref(),
                &cancel,
            )
            .await?;
        }
        Commands::Stop { id } => {
            let lines = queries::stop_arrivals(&transport, &store, id).await?;
            print_json(&lines)?;
        }
        Commands::Line { id } => {
            let line = queries::line_buses(&transport, &store, id).await?;
            print_json(&line.directions)?;
        }
        Commands::Topology { line } => {
            topology(&store, line)?;
        }
    }

    Ok(())
}

#[tracing::instrument(skip_all, fields(watermark = %watermark.to_parameter()))]
async fn sync(
    transport: &Transport,
    store: &EntityStore,
    config: &Config,
    watermark: &Watermark,
    raw_route_ids: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let report = StaticSync::new(transport, store)
        .with_options(SyncOptions {
            fix_route_ids: !raw_route_ids,
        })
        .run_with_retry(watermark, &config.pacing, cancel)
        .await?;

    for message in &report.news {
        info!(id = message.id, date = %message.date, title = %message.title, "News");
    }
    print_pretty(&report.fares);
    Ok(())
}

/// Runs `num_samples` poll cycles, waiting `sample_rate` between them.
#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all, fields(num_samples = num_samples, sample_rate = sample_rate.as_secs()))]
async fn poll(
    transport: &Transport,
    store: &EntityStore,
    config: &Config,
    lines: Vec<LineId>,
    num_samples: usize,
    sample_rate: Duration,
    output: Option<&str>,
    stats_path: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let poller = LivePoller::new(transport, store, config.pacing.clone());
    let lines = if lines.is_empty() {
        poller.known_lines()?
    } else {
        lines
    };
    if lines.is_empty() {
        warn!("No lines known yet; run `sync` first or pass --lines");
        return Ok(());
    }

    if num_samples == 0 {
        info!(lines = lines.len(), "Polling until Ctrl+C");
    } else {
        info!(lines = lines.len(), num_samples, "Starting poll");
    }

    let mut sample_count = 0;
    loop {
        if num_samples > 0 && sample_count >= num_samples {
            break;
        }
        sample_count += 1;

        let outcome = poller.poll(&lines, cancel).await?;
        info!(
            sample = sample_count,
            buses = outcome.buses.len(),
            complete = outcome.complete,
            "Cycle finished"
        );

        if let Some(path) = output {
            let now = Utc::now();
            let rows: Vec<BusRecord> = outcome
                .buses
                .iter()
                .map(|b| BusRecord::new(now, b))
                .collect();
            append_records(path, &rows)?;
        }
        if let Some(path) = stats_path {
            append_record(path, &outcome.stats)?;
        }
        if output.is_none() {
            print_json(&outcome.buses)?;
        }

        if !outcome.complete {
            break;
        }
        if (num_samples == 0 || sample_count < num_samples) && !pause(sample_rate, cancel).await {
            break;
        }
    }

    Ok(())
}

fn topology(store: &EntityStore, line_id: LineId) -> Result<()> {
    store.read(|t| {
        let Some(line) = t.get::<Line>(&line_id) else {
            warn!(line = line_id, "Line not in store; run `sync` first");
            return;
        };
        info!(line = line.id, name = ?line.name, origin = ?line.origin, destination = ?line.destination, "Line");

        for route_id in &line.routes {
            let direction = t.get::<Route>(route_id).map(Route::line_route_id);
            let stops: Vec<StopId> = t.route_sequence(*route_id).iter().map(|rs| rs.stop_id).collect();
            info!(route = route_id, ?direction, ?stops, "Route");
        }
    })?;
    Ok(())
}
