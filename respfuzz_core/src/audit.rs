use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const FILE_PREFIX: &str = "respfuzz-commands-";

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to open audit log {path:?} for append: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write audit log {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Scratch file {path:?} error: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A uniquely named temporary file holding the current batch, one command per line.
///
/// The file is truncated on every `stage` and deleted when the value is dropped.
#[derive(Debug)]
pub struct ScratchFile {
    file: NamedTempFile,
}

impl ScratchFile {
    pub fn new() -> Result<Self, AuditError> {
        let file = tempfile::Builder::new()
            .prefix(FILE_PREFIX)
            .suffix(".tmp")
            .tempfile()
            .map_err(|source| AuditError::Scratch {
                path: std::env::temp_dir(),
                source,
            })?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Replaces the scratch contents with `commands`, in order.
    pub fn stage<S: AsRef<str>>(&mut self, commands: &[S]) -> Result<(), AuditError> {
        let path = self.file.path().to_path_buf();
        let scratch_err = |source| AuditError::Scratch {
            path: path.clone(),
            source,
        };

        let file = self.file.as_file_mut();
        file.set_len(0).map_err(scratch_err)?;
        file.rewind().map_err(scratch_err)?;
        let mut writer = BufWriter::new(file);
        for command in commands {
            writeln!(writer, "{}", command.as_ref()).map_err(scratch_err)?;
        }
        writer.flush().map_err(scratch_err)
    }

    /// Reads back what the last `stage` wrote.
    pub fn staged_commands(&self) -> Result<Vec<String>, AuditError> {
        let scratch_err = |source| AuditError::Scratch {
            path: self.path().to_path_buf(),
            source,
        };
        let file = File::open(self.path()).map_err(scratch_err)?;
        BufReader::new(file)
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .map_err(scratch_err)
    }
}

/// Append-only record of every completed batch.
///
/// Each entry is a blank line, a `BATCH NUMBER - <n>` header and the batch's
/// commands one per line, in send order. The log is never read back by the fuzzer.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A log in `dir` named after `started_at`, the process id and a random tag,
    /// e.g. `respfuzz-commands-20261018103000-4242-9f86d081.log`.
    ///
    /// Runs started within the same second never share a log.
    pub fn in_dir(dir: &Path, started_at: DateTime<Local>) -> Self {
        let file_name = format!(
            "{}{}-{}-{:08x}.log",
            FILE_PREFIX,
            started_at.format("%Y%m%d%H%M%S"),
            std::process::id(),
            rand::random::<u32>()
        );
        Self::new(dir.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_batch<S: AsRef<str>>(
        &self,
        batch_number: u64,
        commands: &[S],
    ) -> Result<(), AuditError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| AuditError::Open {
                path: self.path.clone(),
                source,
            })?;

        let write_err = |source| AuditError::Write {
            path: self.path.clone(),
            source,
        };
        let mut writer = BufWriter::new(file);
        write!(writer, "\nBATCH NUMBER - {batch_number}\n").map_err(write_err)?;
        for command in commands {
            writeln!(writer, "{}", command.as_ref()).map_err(write_err)?;
        }
        writer.flush().map_err(write_err)
    }

    /// Copies the staged batch from `scratch` into the log.
    pub fn append_staged(&self, batch_number: u64, scratch: &ScratchFile) -> Result<(), AuditError> {
        let commands = scratch.staged_commands()?;
        self.append_batch(batch_number, commands.as_slice())
    }
}
