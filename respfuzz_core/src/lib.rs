pub mod audit;
pub mod batch;
pub mod config;
pub mod connection;
pub mod corpus;
pub mod executor;
pub mod mutator;
pub mod runner;

pub use audit::{AuditError, AuditLog, ScratchFile};
pub use batch::{Batch, BatchBuilder, liveness_probe};
pub use config::{ConfigError, CorpusType, FuzzerConfig, ProtocolVersion, TargetAddr};
pub use connection::{ConnectionError, PipelineConnection, Reply, RespConnection};
pub use corpus::{CommandCorpus, CorpusError, InMemoryCorpus, LineIndexedCorpus, load_corpus};
pub use executor::{ExecutionError, ExecutionReport, Executor, PipelineExecutor};
pub use mutator::{Mutator, SpecialCharMutator};
pub use runner::{RunContext, RunError, RunParams, RunSummary, run, run_while};
