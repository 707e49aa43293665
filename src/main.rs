//! Headless host for bulkcheck runs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use bulkcheck_lib::domain::hit::Bucket;
use bulkcheck_lib::infrastructure::{
    AppConfig, ConfigManager, DataPool, JsonlHitStore, ProxySource, init_logging_with_config,
};
use bulkcheck_lib::runner::{CustomInput, HostError};
use bulkcheck_lib::steps::load_script_file;
use bulkcheck_lib::{AppContext, RunEvent, RunHost, RunRequest, RunSession};

#[derive(Parser)]
#[command(name = "bulkcheck")]
#[command(about = "Check record lists against a target with a per-record script")]
#[command(version)]
struct Cli {
    /// Configuration file (default: user config directory)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script over a data file
    Run(RunArgs),
    /// Write the default configuration file if none exists and print its path
    InitConfig,
}

#[derive(Args)]
struct RunArgs {
    /// Script file
    #[arg(short = 's', long)]
    script: PathBuf,

    /// Data file, one record per line
    #[arg(short = 'd', long)]
    data: PathBuf,

    /// Proxy file, one proxy per line
    #[arg(short = 'p', long)]
    proxies: Option<PathBuf>,

    /// Number of workers
    #[arg(short = 'b', long)]
    bots: Option<usize>,

    /// Index of the first record to check
    #[arg(long, value_name = "N")]
    start: Option<usize>,

    /// Where hits are appended as JSON lines
    #[arg(short = 'o', long, default_value = "hits.jsonl")]
    hits_out: PathBuf,

    /// Where the position of the next record is written
    #[arg(long)]
    progress_file: Option<PathBuf>,

    /// Value for a custom input of the script
    #[arg(short = 'i', long = "input", value_name = "NAME=VALUE", value_parser = parse_input)]
    inputs: Vec<(String, String)>,
}

fn parse_input(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))
}

/// Hits to a JSON lines file, progress to a plain text file, custom inputs
/// from the command line
struct CliHost {
    hits: JsonlHitStore,
    progress_file: Option<PathBuf>,
    inputs: Vec<(String, String)>,
}

#[async_trait]
impl RunHost for CliHost {
    async fn custom_inputs(&self, inputs: &[CustomInput]) -> Result<Vec<(String, String)>, HostError> {
        Ok(inputs
            .iter()
            .map(|input| {
                let value = self
                    .inputs
                    .iter()
                    .find(|(name, _)| *name == input.variable_name)
                    .map_or_else(|| input.default_value.clone(), |(_, value)| value.clone());
                if value.is_empty() {
                    warn!("⚠️ No value for custom input {} ({})", input.variable_name, input.description);
                }
                (input.variable_name.clone(), value)
            })
            .collect())
    }

    async fn save_hit(&self, hit: &bulkcheck_lib::domain::hit::Hit) -> Result<(), HostError> {
        self.hits
            .append(hit)
            .await
            .map_err(|e| HostError(e.to_string()))
    }

    async fn save_progress(&self, position: usize) -> Result<(), HostError> {
        let Some(path) = &self.progress_file else {
            return Ok(());
        };
        tokio::fs::write(path, position.to_string())
            .await
            .map_err(|e| HostError(format!("Failed to write {}: {e}", path.display())))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.initialize_on_first_run().await?;
    let _log_guard = init_logging_with_config(&config.logging)?;

    match cli.command {
        Command::InitConfig => {
            println!("📁 Configuration: {}", manager.config_path().display());
            Ok(())
        }
        Command::Run(args) => run(config, args).await,
    }
}

async fn run(config: AppConfig, args: RunArgs) -> Result<()> {
    let script = load_script_file(&args.script)
        .await
        .with_context(|| format!("Failed to load script {}", args.script.display()))?;
    let data = DataPool::from_file(&args.data)
        .await
        .with_context(|| format!("Failed to read data file {}", args.data.display()))?;

    let host = Arc::new(CliHost {
        hits: JsonlHitStore::new(&args.hits_out),
        progress_file: args.progress_file.clone(),
        inputs: args.inputs.clone(),
    });
    let default_protocol = config.proxies.default_protocol;
    let app = Arc::new(AppContext::new(config, host)?);
    let session = RunSession::new(Arc::clone(&app));

    let control = session.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("🛑 Stopping, press Ctrl+C again to abort");
            control.stop();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            control.abort();
        }
    });

    let mut events = app.events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RunEvent::HitFound(hit)) => {
                    let marker = if hit.bucket == Bucket::Hit { "✅" } else { "🔄" };
                    println!("{marker} {} {} {}", hit.label, hit.record, hit.capture_line());
                }
                Ok(RunEvent::Log { entry, .. }) if entry.prompt => println!("⚠️ {}", entry.message),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut request = RunRequest::new(Arc::new(script), data);
    if let Some(path) = args.proxies {
        request = request.with_proxies(ProxySource::file(path).with_default_protocol(default_protocol));
    }
    if let Some(bots) = args.bots {
        request = request.with_bots(bots);
    }
    if let Some(start) = args.start {
        request = request.starting_at(start);
    }

    let result = session.run(request).await;
    printer.abort();
    let summary = result.map_err(|e| anyhow!("Run failed: {e}"))?;

    info!("Summary: {:?}", summary);
    println!(
        "🎉 {:?}: tested {}, hits {}, custom {}, to check {}, fails {}, retries {} in {:.1}s (next record {})",
        summary.stop_reason,
        summary.tested,
        summary.hits,
        summary.customs,
        summary.to_check,
        summary.fails,
        summary.retries,
        summary.elapsed_secs,
        summary.position
    );
    Ok(())
}
