//! cmd2s3 - stream a command's output into S3
//!
//! Runs a shell command and uploads its stdout as a single S3 object without
//! buffering it all or knowing its size up front.

use anyhow::Context;
use clap::Parser;
use cmd2s3::config::{parse_byte_size, Config};
use cmd2s3::process::ShellCommand;
use cmd2s3::s3::{parse_s3_url, S3Client};
use cmd2s3::{logging, metrics, stream_to_storage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upload the stdout of a shell command to S3 as one object
#[derive(Parser, Debug)]
#[command(name = "cmd2s3")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Destination object, e.g. s3://bucket/path/to/key
    s3_url: String,

    /// Shell command whose stdout is uploaded (run with `sh -c`)
    command: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Part size, e.g. 100MiB (minimum 5MiB)
    #[arg(long, value_parser = parse_byte_size)]
    part_size: Option<usize>,

    /// Number of parts buffered ahead of the upload
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Server-side encryption (AES256, aws:kms, none)
    #[arg(long)]
    sse: Option<String>,

    /// AWS region
    #[arg(long)]
    region: Option<String>,

    /// S3-compatible endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Cancel the command and abort the upload after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print the upload summary as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Dump Prometheus metrics to stderr on exit
    #[arg(long)]
    metrics: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration
    fn apply(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
        if let Some(part_size) = self.part_size {
            config.upload.part_size = part_size;
        }
        if let Some(queue_depth) = self.queue_depth {
            config.upload.queue_depth = queue_depth;
        }
        if let Some(sse) = &self.sse {
            config.upload.server_side_encryption = sse.clone();
        }
        if let Some(region) = &self.region {
            config.s3.region = Some(region.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            config.s3.endpoint = Some(endpoint.clone());
        }
    }
}

/// Cancel on Ctrl-C or when the timeout elapses
fn spawn_cancel_triggers(cancel: CancellationToken, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => warn!("Interrupted, cancelling upload"),
            _ = deadline => warn!(timeout_secs = ?timeout.map(|t| t.as_secs()), "Timed out, cancelling upload"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_unvalidated(path)
            .with_context(|| format!("Loading configuration from {:?}", path))?,
        None => Config::default(),
    };
    // File values may be invalid until flags override them
    args.apply(&mut config);
    config.validate()?;

    logging::init_logging(&config.logging)?;

    let target = parse_s3_url(&args.s3_url).context("invalid URL")?;
    let settings = config.upload_settings()?;

    info!(
        destination = %target,
        command = %args.command,
        part_size = settings.part_size,
        "Starting cmd2s3 v{}",
        cmd2s3::VERSION
    );

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(cancel.clone(), args.timeout.map(Duration::from_secs));

    let storage = Arc::new(S3Client::from_config(&config.s3).await);
    let shell = ShellCommand::new(&args.command);
    let output = shell
        .spawn(cancel.clone())
        .with_context(|| format!("Invoking shell command {:?}", shell.command()))?;

    let result = stream_to_storage(output, storage, &target, &settings, &cancel).await;

    if args.metrics {
        eprint!("{}", metrics::render());
    }

    let summary = result.with_context(|| format!("Uploading to {}", target))?;

    info!(
        location = ?summary.location,
        upload_id = %summary.upload_id,
        parts = summary.parts,
        bytes = summary.bytes,
        "Object uploaded"
    );

    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    }

    Ok(())
}
