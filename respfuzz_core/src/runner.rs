use crate::audit::{AuditError, AuditLog, ScratchFile};
use crate::batch::BatchBuilder;
use crate::config::{ConfigError, FuzzerConfig};
use crate::connection::{ConnectionError, PipelineConnection, RespConnection};
use crate::corpus::{CommandCorpus, CorpusError, load_corpus};
use crate::executor::{ExecutionError, Executor, PipelineExecutor};
use crate::mutator::SpecialCharMutator;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// The terminal outcome of a failed run. Batches logged before the failure stay logged.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid run parameters: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load corpus: {0}")]
    Corpus(#[from] CorpusError),

    #[error("Failed to connect to target: {0}")]
    Connect(#[from] ConnectionError),

    #[error("Audit I/O failure: {0}")]
    Audit(#[from] AuditError),

    #[error("Batch {batch} failed after {completed} completed batches: {source}")]
    Execution {
        batch: u64,
        completed: u64,
        #[source]
        source: ExecutionError,
    },

    #[error("Batch {batch} could not be built: {source}")]
    Build {
        batch: u64,
        #[source]
        source: CorpusError,
    },

    #[error("Run interrupted after {completed} completed batches")]
    Interrupted { completed: u64 },
}

/// Totals for a run that finished every batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub batches_completed: u64,
    pub commands_sent: u64,
    pub error_replies: u64,
    pub audit_log: PathBuf,
    pub seed: u64,
    pub elapsed: Duration,
}

/// The values that shape batch generation for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    /// Target port, echoed by the liveness probe.
    pub port: u16,
    pub fuzz: bool,
    pub seed: u64,
    pub num_batches: u64,
}

/// Everything one run owns. Dropping it closes the connection and removes the
/// scratch file, whichever way the run ended.
pub struct RunContext<C: PipelineConnection> {
    executor: PipelineExecutor<C>,
    corpus: Box<dyn CommandCorpus>,
    builder: BatchBuilder<SpecialCharMutator>,
    scratch: ScratchFile,
    audit: AuditLog,
    rng: ChaCha8Rng,
    params: RunParams,
    running: Arc<AtomicBool>,
}

impl<C: PipelineConnection> RunContext<C> {
    pub fn new(
        connection: C,
        corpus: Box<dyn CommandCorpus>,
        scratch: ScratchFile,
        audit: AuditLog,
        params: RunParams,
    ) -> Self {
        Self {
            executor: PipelineExecutor::new(connection),
            corpus,
            builder: BatchBuilder::new(SpecialCharMutator::new(params.fuzz), params.port),
            scratch,
            audit,
            rng: ChaCha8Rng::seed_from_u64(params.seed),
            params,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shares a flag that, once cleared, stops the run before its next batch.
    pub fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn scratch_path(&self) -> PathBuf {
        self.scratch.path().to_path_buf()
    }

    /// Runs batches `1..=num_batches`: build, stage, execute, log. Stops at the first
    /// error, or with `RunError::Interrupted` once the running flag is cleared.
    pub fn run(mut self) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let mut summary = RunSummary {
            batches_completed: 0,
            commands_sent: 0,
            error_replies: 0,
            audit_log: self.audit.path().to_path_buf(),
            seed: self.params.seed,
            elapsed: Duration::ZERO,
        };

        for number in 1..=self.params.num_batches {
            if !self.running.load(Ordering::SeqCst) {
                warn!(completed = summary.batches_completed, "Run interrupted");
                return Err(RunError::Interrupted {
                    completed: summary.batches_completed,
                });
            }
            let batch = self
                .builder
                .build(number, self.corpus.as_ref(), &mut self.rng)
                .map_err(|source| RunError::Build {
                    batch: number,
                    source,
                })?;
            self.scratch.stage(batch.commands())?;

            let report = self.executor.execute_batch(&batch).map_err(|source| {
                error!(batch = number, error = %source, "Batch execution failed");
                RunError::Execution {
                    batch: number,
                    completed: summary.batches_completed,
                    source,
                }
            })?;

            self.audit.append_staged(number, &self.scratch)?;

            summary.batches_completed = number;
            summary.commands_sent += report.commands_sent as u64;
            summary.error_replies += report.error_replies as u64;
            debug!(
                batch = number,
                pipeline_size = batch.pipeline_size(),
                error_replies = report.error_replies,
                "Batch completed"
            );
        }

        summary.elapsed = started.elapsed();
        info!(
            batches = summary.batches_completed,
            commands = summary.commands_sent,
            error_replies = summary.error_replies,
            elapsed = ?summary.elapsed,
            "Run completed"
        );
        Ok(summary)
    }
}

/// Resolves `config` into a live run and executes it to completion.
///
/// Startup order: validate parameters, load the corpus, create the scratch file,
/// connect. Any failure returns before the first batch is built.
pub fn run(config: &FuzzerConfig) -> Result<RunSummary, RunError> {
    run_while(config, Arc::new(AtomicBool::new(true)))
}

/// Like [`run`], but stops between batches once `running` is cleared.
pub fn run_while(
    config: &FuzzerConfig,
    running: Arc<AtomicBool>,
) -> Result<RunSummary, RunError> {
    let target = config.validate()?;
    let corpus = load_corpus(config.corpus_type, &config.commands_file)?;
    info!(
        path = ?config.commands_file,
        commands = corpus.len(),
        corpus_type = config.corpus_type.as_str(),
        "Corpus loaded"
    );

    let seed = config.seed.unwrap_or_else(rand::random);
    let scratch = ScratchFile::new()?;
    let audit = AuditLog::in_dir(&config.output_dir, chrono::Local::now());
    info!(seed, audit_log = ?audit.path(), scratch = ?scratch.path(), "Run resources ready");

    let connection = RespConnection::connect(&target, config.timeout(), config.protocol)?;

    info!(
        %target,
        batches = config.batches,
        fuzz = config.fuzz,
        "Starting fuzz run"
    );
    let params = RunParams {
        port: target.port,
        fuzz: config.fuzz,
        seed,
        num_batches: config.batches,
    };
    RunContext::new(connection, corpus, scratch, audit, params)
        .with_running_flag(running)
        .run()
}
