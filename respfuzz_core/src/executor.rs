use crate::batch::Batch;
use crate::connection::{ConnectionError, PipelineConnection};
use thiserror::Error;
use tracing::{debug, warn};

/// A failed pipelined exchange. Either kind ends the run.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to send {commands} pipelined commands: {source}")]
    Send {
        commands: usize,
        #[source]
        source: ConnectionError,
    },

    /// The reply at `index` (0-based) could not be read; `index` replies were consumed.
    #[error("Failed to read reply {} of {expected}: {source}", .index + 1)]
    Reply {
        index: usize,
        expected: usize,
        #[source]
        source: ConnectionError,
    },
}

impl ExecutionError {
    /// The number of replies successfully drained before the failure.
    pub fn replies_consumed(&self) -> usize {
        match self {
            ExecutionError::Send { .. } => 0,
            ExecutionError::Reply { index, .. } => *index,
        }
    }
}

/// What a successful batch execution observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub commands_sent: usize,
    pub replies_read: usize,
    /// Replies the server returned as error values. They still count as replies.
    pub error_replies: usize,
}

pub trait Executor {
    fn execute_batch(&mut self, batch: &Batch) -> Result<ExecutionReport, ExecutionError>;
}

/// Drives batches through a single owned connection: every command is written
/// before the first reply is read, then exactly `batch.len()` replies are drained
/// in send order, stopping at the first failure.
///
/// Reply contents are not validated. A batch succeeds when every command, the
/// trailing liveness probe included, got a reply without a connection-level error.
pub struct PipelineExecutor<C: PipelineConnection> {
    connection: C,
}

impl<C: PipelineConnection> PipelineExecutor<C> {
    pub fn new(connection: C) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn into_connection(self) -> C {
        self.connection
    }
}

impl<C: PipelineConnection> Executor for PipelineExecutor<C> {
    fn execute_batch(&mut self, batch: &Batch) -> Result<ExecutionReport, ExecutionError> {
        let expected = batch.len();
        self.connection
            .send_pipelined(batch.commands())
            .map_err(|source| {
                warn!(batch = batch.number(), error = %source, "Pipelined send failed");
                ExecutionError::Send {
                    commands: expected,
                    source,
                }
            })?;

        let report = (0..expected).try_fold(
            ExecutionReport {
                commands_sent: expected,
                ..ExecutionReport::default()
            },
            |mut report, index| {
                let reply = self.connection.read_reply().map_err(|source| {
                    warn!(
                        batch = batch.number(),
                        index,
                        expected,
                        error = %source,
                        "Reply read failed"
                    );
                    ExecutionError::Reply {
                        index,
                        expected,
                        source,
                    }
                })?;
                report.replies_read += 1;
                if reply.is_error() {
                    report.error_replies += 1;
                }
                Ok::<_, ExecutionError>(report)
            },
        )?;

        debug!(
            batch = batch.number(),
            replies = report.replies_read,
            error_replies = report.error_replies,
            "Batch drained"
        );
        Ok(report)
    }
}
