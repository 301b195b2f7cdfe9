use crate::config::CorpusType;
use rand::Rng;
use rand_core::RngCore;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise while loading or sampling a command corpus.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The corpus file holds no usable command line.
    #[error("Commands file {0:?} is empty or contains no commands")]
    Empty(PathBuf),

    /// The corpus file could not be opened or read.
    #[error("Failed to read commands file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sampled line index no longer exists in the file (it shrank after load).
    #[error("Command line {index} not found in {path:?}")]
    LineNotFound { path: PathBuf, index: usize },
}

/// A read-only collection of command templates used as mutation seeds.
///
/// Templates are indexed `0..len()`. Implementations guarantee `len() >= 1`
/// once constructed, so `sample` always has something to return.
pub trait CommandCorpus: Send + Sync {
    /// Returns the number of command templates.
    fn len(&self) -> usize;

    /// Returns `true` if the corpus holds no templates.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the template at `index`.
    fn get(&self, index: usize) -> Result<String, CorpusError>;

    /// Returns the template at a uniformly random index in `[0, len())`.
    fn sample(&self, rng: &mut dyn RngCore) -> Result<String, CorpusError> {
        let index = rng.random_range(0..self.len());
        self.get(index)
    }
}

fn is_command_line(line: &str) -> bool {
    !line.trim().is_empty()
}

fn strip_line_ending(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// A corpus that caches every command line in memory at load time.
#[derive(Debug, Clone)]
pub struct InMemoryCorpus {
    commands: Vec<String>,
}

impl InMemoryCorpus {
    /// Loads every non-blank line of `path` as a command template.
    ///
    /// Blank and whitespace-only lines are not templates. An empty command encodes
    /// to a zero-length request, which a RESP server answers with nothing and
    /// would leave the pipeline one reply short. The lone special character
    /// such a line would yield under mutation is therefore never sent.
    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let content = fs::read_to_string(path).map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let commands: Vec<String> = content
            .split('\n')
            .map(strip_line_ending)
            .filter(|line| is_command_line(line))
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            return Err(CorpusError::Empty(path.to_path_buf()));
        }
        Ok(Self { commands })
    }

    /// Builds a corpus from templates already in memory. Blank entries are dropped.
    pub fn from_commands<I, S>(commands: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: Vec<String> = commands
            .into_iter()
            .map(Into::into)
            .filter(|line| is_command_line(line))
            .collect();
        if commands.is_empty() {
            None
        } else {
            Some(Self { commands })
        }
    }
}

impl CommandCorpus for InMemoryCorpus {
    fn len(&self) -> usize {
        self.commands.len()
    }

    fn get(&self, index: usize) -> Result<String, CorpusError> {
        self.commands
            .get(index)
            .cloned()
            .ok_or_else(|| CorpusError::LineNotFound {
                path: PathBuf::from("<memory>"),
                index,
            })
    }
}

/// A corpus that keeps only the file path and the command count.
///
/// Every `get` re-reads the file from the start up to the requested command,
/// so edits to the file between samples are visible as long as the number of
/// commands does not shrink below the loaded count.
#[derive(Debug, Clone)]
pub struct LineIndexedCorpus {
    path: PathBuf,
    command_count: usize,
}

impl LineIndexedCorpus {
    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let mut command_count = 0;
        for line in Self::open_lines(path)? {
            let line = line.map_err(|source| CorpusError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if is_command_line(strip_line_ending(&line)) {
                command_count += 1;
            }
        }
        if command_count == 0 {
            return Err(CorpusError::Empty(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            command_count,
        })
    }

    fn open_lines(path: &Path) -> Result<std::io::Lines<BufReader<File>>, CorpusError> {
        let file = File::open(path).map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(BufReader::new(file).lines())
    }
}

impl CommandCorpus for LineIndexedCorpus {
    fn len(&self) -> usize {
        self.command_count
    }

    fn get(&self, index: usize) -> Result<String, CorpusError> {
        let mut seen = 0;
        for line in Self::open_lines(&self.path)? {
            let line = line.map_err(|source| CorpusError::Io {
                path: self.path.clone(),
                source,
            })?;
            let line = strip_line_ending(&line);
            if !is_command_line(line) {
                continue;
            }
            if seen == index {
                return Ok(line.to_string());
            }
            seen += 1;
        }
        Err(CorpusError::LineNotFound {
            path: self.path.clone(),
            index,
        })
    }
}

/// Loads the corpus at `path` using the strategy selected by `corpus_type`.
pub fn load_corpus(
    corpus_type: CorpusType,
    path: &Path,
) -> Result<Box<dyn CommandCorpus>, CorpusError> {
    let corpus: Box<dyn CommandCorpus> = match corpus_type {
        CorpusType::InMemory => Box::new(InMemoryCorpus::load(path)?),
        CorpusType::LineIndexed => Box::new(LineIndexedCorpus::load(path)?),
    };
    Ok(corpus)
}
