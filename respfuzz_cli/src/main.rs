use respfuzz_core::config::{CorpusType, FuzzerConfig, ProtocolVersion};
use respfuzz_core::runner::{self, RunError};

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CliCorpusType {
    InMemory,
    LineIndexed,
}

impl From<CliCorpusType> for CorpusType {
    fn from(value: CliCorpusType) -> Self {
        match value {
            CliCorpusType::InMemory => CorpusType::InMemory,
            CliCorpusType::LineIndexed => CorpusType::LineIndexed,
        }
    }
}

/// Sends randomized, optionally mutated, pipelined command batches to a RESP server.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Target server as HOST:PORT
    target: Option<String>,
    /// Number of batches to send
    batches: Option<u64>,
    /// File with one command template per line
    commands_file: Option<PathBuf>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Protocol version to negotiate (2 or 3)
    #[clap(short, long, value_parser = clap::value_parser!(u8).range(2..=3))]
    protocol: Option<u8>,
    /// Insert a random special character into every sampled command
    #[clap(short, long)]
    fuzz: bool,
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Directory for the timestamped audit log
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    #[clap(long, value_enum)]
    corpus_type: Option<CliCorpusType>,
    #[clap(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_file: Option<PathBuf>) -> Result<FuzzerConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            FuzzerConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("respfuzz.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                FuzzerConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and 'respfuzz.toml' not found, using built-in defaults");
                Ok(FuzzerConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut FuzzerConfig, cli: Cli) {
    if let Some(target) = cli.target {
        config.target = target;
    }
    if let Some(batches) = cli.batches {
        config.batches = batches;
    }
    if let Some(commands_file) = cli.commands_file {
        config.commands_file = commands_file;
    }
    if let Some(protocol) = cli.protocol.and_then(ProtocolVersion::from_number) {
        config.protocol = protocol;
    }
    if cli.fuzz {
        config.fuzz = true;
    }
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(corpus_type) = cli.corpus_type {
        config.corpus_type = corpus_type.into();
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = load_config(cli.config_file.clone())?;
    apply_overrides(&mut config, cli);
    info!("Effective configuration: {config:?}");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping after the current batch...");
        r.store(false, Ordering::SeqCst);
    })?;

    let summary = match runner::run_while(&config, running) {
        Ok(summary) => summary,
        Err(RunError::Interrupted { completed }) => {
            warn!(completed, "Stopped by signal");
            println!("Interrupted after {completed} batches.");
            std::process::exit(130);
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "Completed {} batches ({} commands, {} error replies) in {:.2?}.",
        summary.batches_completed, summary.commands_sent, summary.error_replies, summary.elapsed
    );
    println!("Seed: {}", summary.seed);
    println!("Audit log: {}", summary.audit_log.display());
    Ok(())
}
