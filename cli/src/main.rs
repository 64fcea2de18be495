mod cli;
mod config;
mod probe;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use secrecy::ExposeSecret;
use serde::Serialize;
use sipatrol_shared::{
    wait_for_officer, ConnectivityMonitor, Coordinates, HttpReportApi, LocalId, NewReport,
    OfflineReportRecord, Photo, RecordCodec, RetryPolicy, Sealer, SqliteStore, SyncService,
    SyncStatus, SystemClock, TriggerOutcome, UnixTimeMs,
};
use sipatrol_shared::session::{PROFILE_WAIT_ATTEMPTS, PROFILE_WAIT_DELAY};
use tokio::sync::watch;
use tracing::{info, warn};

use cli::{Cli, Commands};
use config::AppConfig;

const STORE_NAME: &str = "offline_reports";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let config = AppConfig::load(cli.config.as_deref())?;
    let api = Arc::new(HttpReportApi::new(
        &config.api_base_url,
        config.api_token(),
        Duration::from_secs(config.request_timeout_secs),
    )?);
    let monitor = ConnectivityMonitor::default();
    let service = open_service(&config, Arc::clone(&api), monitor.clone()).await?;

    let result = match cli.command {
        Commands::Capture {
            photo,
            lat,
            lon,
            notes,
            captured_at,
        } => {
            let bytes = tokio::fs::read(&photo)
                .await
                .with_context(|| format!("failed to read {}", photo.display()))?;
            let photo = Photo::from_bytes(bytes, config.sync.max_photo_bytes)?;
            let coordinates = Coordinates::new(lat, lon)?;
            let captured_at = match captured_at {
                Some(ts) => UnixTimeMs::parse_rfc3339(&ts)?,
                None => UnixTimeMs::now(),
            };
            let mut report = NewReport::new(photo, coordinates, captured_at);
            if let Some(notes) = notes {
                report = report.with_notes(notes)?;
            }

            let record = service.capture(report).await?;
            println!("queued {}", record.local_id());

            if refresh_connectivity(&api, &monitor).await {
                print_outcome(&service.sync_now().await?);
            } else {
                println!("offline: report will be sent when connectivity returns");
            }
            Ok(())
        }

        Commands::List { json, attention } => {
            let records = if attention {
                service.queue().needs_attention().await
            } else {
                service.queue().list_all().await
            };
            let policy = service.queue().policy();
            let rows: Vec<ListRow> = records
                .iter()
                .map(|r| ListRow::from_record(r, policy))
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("no queued reports");
            } else {
                for row in &rows {
                    println!(
                        "{}  {:<8} {}  attempts={}{}{}",
                        row.local_id,
                        row.status,
                        row.captured_at,
                        row.attempt_count,
                        if row.needs_attention { "  NEEDS ATTENTION" } else { "" },
                        row.last_error
                            .as_deref()
                            .map(|e| format!("  ({e})"))
                            .unwrap_or_default(),
                    );
                }
            }
            Ok(())
        }

        Commands::Status { json } => {
            monitor.set_online(api.ping().await);
            let status = service.status();
            let quarantined = service.queue().quarantined().await.len();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status, quarantined);
            }
            Ok(())
        }

        Commands::Sync => {
            if refresh_connectivity(&api, &monitor).await {
                print_outcome(&service.sync_now().await?);
            } else {
                println!(
                    "offline: {} report(s) stay queued",
                    service.status().pending_count
                );
            }
            Ok(())
        }

        Commands::Retry { id } => {
            let local_id = LocalId::new(id)?;
            service.retry(&local_id).await?;
            println!("{local_id} reset to pending");
            if refresh_connectivity(&api, &monitor).await {
                print_outcome(&service.sync_now().await?);
            }
            Ok(())
        }

        Commands::Discard { id } => {
            let local_id = LocalId::new(id)?;
            service.discard(&local_id).await?;
            println!("{local_id} discarded");
            Ok(())
        }

        Commands::Run => run(&config, api, &service).await,
    };

    service.shutdown().await;
    result
}

fn init_logging(verbose: bool, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "sipatrol=debug,sipatrol_shared=debug"
    } else {
        "sipatrol=info,sipatrol_shared=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

async fn open_service(
    config: &AppConfig,
    api: Arc<HttpReportApi>,
    monitor: ConnectivityMonitor,
) -> Result<SyncService> {
    let data_dir = config.data_dir()?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    let codec = match &config.encryption_key_hex {
        Some(key) => {
            let sealer = Sealer::from_hex(key.expose_secret())?;
            RecordCodec::sealed(Arc::new(sealer), STORE_NAME, config.officer_id.as_deref())?
        }
        None => RecordCodec::plain(),
    };
    let store = SqliteStore::open(data_dir.join("queue.db"), codec)?;

    let service = SyncService::open(
        Arc::new(store),
        api,
        monitor,
        config.sync.clone(),
        Arc::new(SystemClock),
    )
    .await?;

    let quarantined = service.queue().quarantined().await;
    if !quarantined.is_empty() {
        warn!(
            count = quarantined.len(),
            "some queued reports could not be read and were set aside"
        );
    }
    Ok(service)
}

async fn refresh_connectivity(api: &HttpReportApi, monitor: &ConnectivityMonitor) -> bool {
    monitor.set_online(api.ping().await);
    monitor.is_online()
}

async fn run(config: &AppConfig, api: Arc<HttpReportApi>, service: &SyncService) -> Result<()> {
    match wait_for_officer(api.as_ref(), PROFILE_WAIT_ATTEMPTS, PROFILE_WAIT_DELAY).await {
        Ok(officer) => {
            info!(officer_id = %officer.id, unit = ?officer.assigned_unit_id, "signed in");
        }
        Err(e) if e.allows_offline_capture() => {
            warn!(error = %e, "server unreachable, syncing once it is back");
        }
        Err(e) => bail!(e),
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let probe = probe::spawn(
        Arc::clone(&api),
        service.monitor().clone(),
        Duration::from_secs(config.probe_interval_secs),
        stop_rx.clone(),
    );

    let mut surface = service.surface();
    let mut stop = stop_rx;
    let reporter = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                status = surface.changed() => match status {
                    Some(s) => info!(
                        online = s.online,
                        pending = s.pending_count,
                        needs_attention = s.needs_attention_count,
                        syncing = s.is_syncing,
                        "queue status"
                    ),
                    None => break,
                },
            }
        }
    });

    service.start();
    info!("running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    stop_tx.send_replace(true);
    let _ = probe.await;
    let _ = reporter.await;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRow {
    local_id: String,
    status: &'static str,
    captured_at: String,
    attempt_count: u32,
    needs_attention: bool,
    has_notes: bool,
    last_error: Option<String>,
}

impl ListRow {
    fn from_record(record: &OfflineReportRecord, policy: &RetryPolicy) -> Self {
        Self {
            local_id: record.local_id().to_string(),
            status: record.status().as_str(),
            captured_at: record.captured_at().to_rfc3339(),
            attempt_count: record.attempt_count(),
            needs_attention: record.needs_attention(policy),
            has_notes: record.notes().is_some(),
            last_error: record.last_error().map(ToString::to_string),
        }
    }
}

fn print_status(status: &SyncStatus, quarantined: usize) {
    println!("online:          {}", if status.online { "yes" } else { "no" });
    println!("pending:         {}", status.pending_count);
    println!("needs attention: {}", status.needs_attention_count);
    if quarantined > 0 {
        println!("unreadable:      {quarantined}");
    }
    match status.last_sync_at {
        Some(at) => println!("last sync:       {}", at.to_rfc3339()),
        None => println!("last sync:       never (this session)"),
    }
    if let Some(err) = &status.last_error {
        println!("last error:      {err}");
    }
}

fn print_outcome(outcome: &TriggerOutcome) {
    match outcome {
        TriggerOutcome::Completed(s) => {
            print!(
                "sent {} of {} (duplicates {}, failed {}, waiting {})",
                s.synced, s.attempted, s.duplicates, s.failed, s.skipped
            );
            match s.aborted {
                Some(category) => println!(", stopped early: {category}"),
                None => println!(),
            }
        }
        TriggerOutcome::Coalesced => println!("a sync pass is already running"),
        TriggerOutcome::SkippedOffline => println!("offline: nothing sent"),
    }
}
