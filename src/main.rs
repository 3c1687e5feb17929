//! `fanout`: fetch many URLs concurrently through the dispatcher.
//!
//! Prints one JSON line per final completion on stdout and a run summary on
//! stderr. Ctrl-C cancels the run.

use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http_fanout::config::{load_config, validate_config, ConfigError, DispatchConfig};
use http_fanout::dispatch::{Completion, Dispatcher};
use http_fanout::http::Request;
use http_fanout::lifecycle::{signals, Shutdown};
use http_fanout::observability::{logging, metrics};
use http_fanout::resilience::RetryPolicy;
use http_fanout::transport::ReqwestTransport;

#[derive(Parser)]
#[command(name = "fanout")]
#[command(about = "Fetch many URLs with bounded concurrency and retries", long_about = None)]
struct Cli {
    /// URLs to fetch
    urls: Vec<String>,

    /// File with one URL per line, `-` for stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum concurrent exchanges
    #[arg(short, long)]
    window: Option<usize>,

    /// Maximum retries per URL
    #[arg(short, long)]
    retries: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Delay after every admission, in milliseconds
    #[arg(long)]
    pacing_ms: Option<u64>,

    #[arg(short, long, default_value = "GET")]
    method: String,

    /// HTTP statuses worth retrying, comma separated
    #[arg(long, value_delimiter = ',')]
    retry_on_status: Option<Vec<u16>>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Serialize)]
struct Outcome<'a> {
    sequence: u64,
    url: &'a str,
    status: Option<u16>,
    bytes: u64,
    retries: u32,
    elapsed_ms: u128,
    error: Option<String>,
}

fn print_completion(completion: &Completion) {
    let url = completion
        .info
        .effective_url
        .as_deref()
        .unwrap_or_else(|| completion.request.url().as_str());
    let outcome = Outcome {
        sequence: completion.sequence.into(),
        url,
        status: completion.response.status().map(|s| s.as_u16()),
        bytes: completion.info.bytes_downloaded,
        retries: completion.retries,
        elapsed_ms: completion.info.total_time.as_millis(),
        error: completion.info.error.as_ref().map(ToString::to_string),
    };
    match serde_json::to_string(&outcome) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::error!(error = %e, "Failed to encode outcome"),
    }
}

fn read_urls(path: &Path) -> io::Result<Vec<String>> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(path)?))
    };

    let mut urls = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() && !line.starts_with('#') {
            urls.push(line.to_string());
        }
    }
    Ok(urls)
}

fn apply_overrides(config: &mut DispatchConfig, cli: &Cli) {
    if let Some(window) = cli.window {
        config.window_size = window;
    }
    if let Some(retries) = cli.retries {
        config.max_retries = retries;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(pacing) = cli.pacing_ms {
        config.pacing_delay_ms = pacing;
    }
    if cli.json_logs {
        config.observability.json = true;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => DispatchConfig::default(),
    };
    apply_overrides(&mut config, &cli);
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init_logging(&config.observability);
    tracing::info!(
        window_size = config.window_size,
        max_retries = config.max_retries,
        timeout_secs = config.timeout_secs,
        pacing_delay_ms = config.pacing_delay_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut urls = cli.urls.clone();
    if let Some(path) = &cli.input {
        urls.extend(read_urls(path)?);
    }

    let mut requests = Vec::with_capacity(urls.len());
    for url in &urls {
        match Request::parse(&cli.method, url) {
            Ok(request) => requests.push(request),
            Err(e) => tracing::error!(url = %url, error = %e, "Skipping invalid request"),
        }
    }

    let transport = Arc::new(ReqwestTransport::from_config(&config)?);
    let shutdown = Shutdown::new();
    signals::cancel_on_ctrl_c(shutdown.clone());

    let mut dispatcher = Dispatcher::new(config, transport).with_cancellation(shutdown.token());
    dispatcher.extend(requests);

    let mut policy = RetryPolicy::new(|completion: Completion| print_completion(&completion));
    if let Some(statuses) = cli.retry_on_status.clone() {
        policy = policy.with_statuses(statuses);
    }

    let report = dispatcher.process(&mut policy).await?;
    dispatcher.close();

    eprintln!("{}", serde_json::to_string(&report)?);
    Ok(())
}
