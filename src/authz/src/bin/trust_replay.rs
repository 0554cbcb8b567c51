//! Trust Replay - feeds a recorded metrics series through the Trust Monitor
//!
//! Reads one JSON `TrustMetrics` object per line, evaluates the samples on a
//! synthetic clock spaced `--interval-secs` apart, and prints every applied
//! transition as a JSON line.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cretoai_resilient_authz::{
    AuthzConfig, SecurityTelemetry, TrustMetrics, TrustMonitor, TrustMonitorConfig,
};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Trust Monitor replay CLI
#[derive(Parser)]
#[command(name = "trust-replay")]
#[command(about = "Replay recorded backend health metrics through the Trust Monitor")]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, env = "AUTHZ_CONFIG")]
    config: Option<PathBuf>,

    /// JSON-lines metrics file, or "-" for stdin
    #[arg(short, long)]
    metrics: PathBuf,

    /// Seconds between consecutive samples (defaults to the configured evaluation interval)
    #[arg(short, long)]
    interval_secs: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct ReplayLine<'a> {
    sample: usize,
    offset_secs: u64,
    #[serde(flatten)]
    transition: &'a cretoai_resilient_authz::TrustTransition,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},cretoai_resilient_authz=info", log_level).into()),
        )
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => AuthzConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => AuthzConfig::default(),
    };
    let monitor_config: TrustMonitorConfig = config.monitor_config();
    let interval = cli
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.evaluation_interval());

    let reader: Box<dyn BufRead> = if cli.metrics.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(&cli.metrics)
            .with_context(|| format!("Failed to open metrics file {:?}", cli.metrics))?;
        Box::new(BufReader::new(file))
    };

    let telemetry = Arc::new(SecurityTelemetry::with_tracing_alerts().context("Failed to create telemetry")?);
    let monitor = TrustMonitor::new(monitor_config, telemetry);
    let mut events = monitor.subscribe();
    let start = Instant::now();

    info!(
        interval_secs = interval.as_secs(),
        min_dwell_secs = monitor.config().min_dwell.as_secs(),
        confirmations = monitor.config().downgrade_confirmations,
        "Replaying trust metrics"
    );

    let mut samples = 0usize;
    let mut transitions = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read metrics line")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let metrics: TrustMetrics = match serde_json::from_str(trimmed) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed metrics line");
                continue;
            }
        };

        let offset = sample_offset(interval, samples)?;
        let at = start
            .checked_add(offset)
            .with_context(|| format!("Replay clock overflowed at sample {}", samples))?;
        monitor.evaluate_at(metrics, at);

        while let Ok(transition) = events.try_recv() {
            transitions += 1;
            let out = ReplayLine {
                sample: samples,
                offset_secs: offset.as_secs(),
                transition: &transition,
            };
            println!("{}", serde_json::to_string(&out).context("Failed to encode transition")?);
        }

        samples += 1;
    }

    info!(
        samples,
        transitions,
        final_level = %monitor.current(),
        "Replay complete"
    );
    Ok(())
}

/// Synthetic clock offset of the `sample`-th evaluation
fn sample_offset(interval: Duration, sample: usize) -> Result<Duration> {
    let n = u32::try_from(sample).with_context(|| format!("Too many samples to replay: {}", sample))?;
    interval
        .checked_mul(n)
        .ok_or_else(|| anyhow!("Replay offset overflowed: {:?} x {}", interval, sample))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_offsets_are_spaced_by_interval() {
        let interval = Duration::from_secs(30);
        assert_eq!(sample_offset(interval, 0).unwrap(), Duration::ZERO);
        assert_eq!(sample_offset(interval, 4).unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn test_huge_interval_is_an_error() {
        let err = sample_offset(Duration::from_secs(u64::MAX), 2).unwrap_err();
        assert!(err.to_string().contains("overflowed"));
    }

    #[test]
    fn test_clock_overflow_is_an_error() {
        let offset = sample_offset(Duration::MAX, 1).unwrap();
        assert!(Instant::now().checked_add(offset).is_none());
    }
}
