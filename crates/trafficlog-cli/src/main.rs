//! TrafficLog CLI
//!
//! Feeds captured HTTP transactions into the activity store and inspects it

mod config;
mod ingest;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use trafficlog_core::StatsReport;
use trafficlog_recorder::{ActivityRecorder, RecordOutcome, create_storage};

use crate::config::AppConfig;
use crate::ingest::IngestRecord;

#[derive(Parser)]
#[command(name = "trafficlog")]
#[command(about = "TrafficLog - HTTP activity persistence", long_about = None)]
struct Cli {
    /// Path to a YAML or TOML configuration file
    #[arg(long, global = true, env = "TRAFFICLOG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record JSON-lines transactions from a file or stdin
    Ingest {
        /// Input file; reads stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Print pipeline metrics after the run
        #[arg(long, default_value = "false")]
        print_metrics: bool,
    },
    /// Print statistics for the configured store
    Stats,
    /// Connect to the configured store and report it
    Check,
}

#[derive(Debug, Default)]
struct IngestSummary {
    lines: u64,
    queued: u64,
    paused: u64,
    suspended: u64,
    dropped: u64,
    invalid: u64,
}

impl IngestSummary {
    fn tally(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Queued => self.queued += 1,
            RecordOutcome::Paused => self.paused += 1,
            RecordOutcome::Suspended => self.suspended += 1,
            RecordOutcome::Dropped => self.dropped += 1,
        }
    }
}

impl std::fmt::Display for IngestSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Read {} lines: {} queued, {} dropped, {} paused, {} suspended, {} invalid",
            self.lines, self.queued, self.dropped, self.paused, self.suspended, self.invalid
        )
    }
}

/// Wait until the queue has room so a bulk import does not trip the drop path
async fn wait_for_capacity(recorder: &ActivityRecorder) {
    loop {
        let stats = recorder.queue_stats();
        if stats.pending < stats.capacity {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn ingest_lines<R>(
    recorder: &ActivityRecorder,
    settings: &trafficlog_core::CaptureSettings,
    input: R,
) -> anyhow::Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        summary.lines += 1;

        let parsed = IngestRecord::parse(&line).and_then(|record| {
            let request = record.request_descriptor()?;
            let response = record.response_descriptor()?;
            Ok((record, request, response))
        });
        let (record, request, response) = match parsed {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Skipping line {}: {}", summary.lines, e);
                summary.invalid += 1;
                continue;
            }
        };

        wait_for_capacity(recorder).await;
        let outcome = recorder.record(
            settings,
            &request,
            response.as_ref(),
            &record.tool,
            record.started_at,
        );
        summary.tally(outcome);
    }

    Ok(summary)
}

async fn run_ingest(
    config: &AppConfig,
    file: Option<PathBuf>,
    print_metrics: bool,
) -> anyhow::Result<()> {
    let recorder = ActivityRecorder::from_config(&config.storage).await?;
    if recorder.is_logging_paused() {
        warn!(
            "Storage unavailable, transactions will not be persisted (backend: {})",
            recorder.kind()
        );
    }

    let settings = config.storage.capture;
    let summary = match file {
        Some(path) => {
            let handle = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            ingest_lines(&recorder, &settings, BufReader::new(handle)).await?
        }
        None => ingest_lines(&recorder, &settings, BufReader::new(tokio::io::stdin())).await?,
    };

    let metrics = recorder.metrics();
    if !recorder.shutdown().await {
        warn!("Writer did not finish in time, some events may be lost");
    }

    println!("{}", summary);
    if print_metrics {
        print!("{}", metrics.gather_text()?);
    }
    Ok(())
}

async fn run_stats(config: &AppConfig) -> anyhow::Result<()> {
    let store = create_storage(&config.storage).await?;
    let stats = store.stats().await;
    store.shutdown().await;

    let stats = stats?;
    println!(
        "{}",
        StatsReport::new(&stats, store.backend().size_is_estimate())
    );
    Ok(())
}

async fn run_check(config: &AppConfig) -> anyhow::Result<()> {
    let store = create_storage(&config.storage).await?;
    let connected = store.backend().ensure_connection().await;
    let description = store.backend().describe();
    store.shutdown().await;

    connected?;
    println!("OK: {} ({})", description, store.kind());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    logging::init_logging(&config.logging)?;
    info!("Using {} storage backend", config.storage.backend.kind());

    match cli.command {
        Commands::Ingest {
            file,
            print_metrics,
        } => run_ingest(&config, file, print_metrics).await,
        Commands::Stats => run_stats(&config).await,
        Commands::Check => run_check(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trafficlog_core::CaptureSettings;
    use trafficlog_recorder::{BackendConfig, SqliteSettings, StorageConfig};

    fn sqlite_config(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig {
            backend: BackendConfig::Sqlite(SqliteSettings {
                path: dir.path().join("activity.db"),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_lines_tallies_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let config = sqlite_config(&dir);
        let recorder = ActivityRecorder::from_config(&config).await.unwrap();

        let input = concat!(
            r#"{"request":{"url":"http://a/1"}}"#,
            "\n\n",
            "not json\n",
            r#"{"request":{"url":"http://a/2","method":"POST","body":"x"},"response":{"status_code":204}}"#,
            "\n",
        );
        let settings = CaptureSettings {
            paused: false,
            include_responses: true,
        };
        let summary = ingest_lines(&recorder, &settings, input.as_bytes())
            .await
            .unwrap();

        assert_eq!(summary.lines, 3);
        assert_eq!(summary.queued, 2);
        assert_eq!(summary.invalid, 1);

        assert!(recorder.shutdown().await);
        let store = create_storage(&config).await.unwrap();
        assert_eq!(store.stats().await.unwrap().total_record_count, 2);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_paused_settings_skip_everything() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ActivityRecorder::from_config(&sqlite_config(&dir))
            .await
            .unwrap();

        let settings = CaptureSettings {
            paused: true,
            include_responses: false,
        };
        let summary = ingest_lines(
            &recorder,
            &settings,
            r#"{"request":{"url":"http://a/1"}}"#.as_bytes(),
        )
        .await
        .unwrap();

        assert_eq!(summary.paused, 1);
        assert_eq!(summary.queued, 0);
        recorder.shutdown().await;
    }

    #[test]
    fn test_summary_display() {
        let mut summary = IngestSummary {
            lines: 2,
            ..Default::default()
        };
        summary.tally(RecordOutcome::Queued);
        summary.tally(RecordOutcome::Dropped);
        assert_eq!(
            summary.to_string(),
            "Read 2 lines: 1 queued, 1 dropped, 0 paused, 0 suspended, 0 invalid"
        );
    }
}
