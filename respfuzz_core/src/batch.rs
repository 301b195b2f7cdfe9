use crate::corpus::{CommandCorpus, CorpusError};
use crate::mutator::Mutator;
use rand::Rng;
use rand_core::RngCore;
use std::ops::RangeInclusive;
use tracing::trace;

/// Bounds for the number of corpus commands drawn per batch, before the probe.
pub const PIPELINE_SIZE_RANGE: RangeInclusive<usize> = 1..=10;

/// The liveness probe appended to every batch. Never mutated.
pub fn liveness_probe(port: u16) -> String {
    format!("PING {port}")
}

/// One pipelined unit of work: the mutated commands followed by the liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    number: u64,
    commands: Vec<String>,
}

impl Batch {
    /// Builds a batch from already-mutated commands; the probe for `port` is appended last.
    pub fn new(number: u64, mut commands: Vec<String>, port: u16) -> Self {
        commands.push(liveness_probe(port));
        Self { number, commands }
    }

    /// The 1-based batch number within the run.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Every command in send order, probe included.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// The number of commands drawn from the corpus (probe excluded).
    pub fn pipeline_size(&self) -> usize {
        self.commands.len() - 1
    }

    pub fn probe(&self) -> &str {
        // `new` always pushes the probe, so the batch is never empty.
        self.commands.last().map(String::as_str).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Assembles randomly sized batches of mutated corpus commands.
pub struct BatchBuilder<M: Mutator> {
    mutator: M,
    port: u16,
}

impl<M: Mutator> BatchBuilder<M> {
    pub fn new(mutator: M, port: u16) -> Self {
        Self { mutator, port }
    }

    /// Draws a pipeline size from [`PIPELINE_SIZE_RANGE`], fills that many slots with
    /// sampled and mutated commands, then appends the liveness probe.
    pub fn build(
        &mut self,
        number: u64,
        corpus: &dyn CommandCorpus,
        rng: &mut dyn RngCore,
    ) -> Result<Batch, CorpusError> {
        let pipeline_size = rng.random_range(PIPELINE_SIZE_RANGE);
        let mut commands = Vec::with_capacity(pipeline_size + 1);
        for _ in 0..pipeline_size {
            let template = corpus.sample(rng)?;
            let command = self.mutator.mutate(&template, rng);
            trace!(batch = number, %template, %command, "Sampled command");
            commands.push(command);
        }
        Ok(Batch::new(number, commands, self.port))
    }
}
