use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating run parameters.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid target '{0}': expected HOST:PORT")]
    InvalidTarget(String),
    #[error("Invalid port '{0}': expected a number between 1 and 65535")]
    InvalidPort(String),
    #[error("Number of batches must be a positive integer")]
    InvalidBatchCount,
    #[error("Timeout must be greater than zero milliseconds")]
    InvalidTimeout,
}

/// A resolved `host:port` pair for the target server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl FromStr for TargetAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidTarget(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ConfigError::InvalidTarget(s.to_string()));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| ConfigError::InvalidPort(port_str.to_string()))?;
        if port == 0 {
            return Err(ConfigError::InvalidPort(port_str.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    Resp3,
}

impl ProtocolVersion {
    pub fn from_number(version: u8) -> Option<Self> {
        match version {
            2 => Some(ProtocolVersion::Resp2),
            3 => Some(ProtocolVersion::Resp3),
            _ => None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusType {
    #[default]
    InMemory,
    LineIndexed,
}

impl CorpusType {
    pub fn as_str(&self) -> &str {
        match self {
            CorpusType::InMemory => "InMemory",
            CorpusType::LineIndexed => "LineIndexed",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerConfig {
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_batches")]
    pub batches: u64,
    #[serde(default = "default_commands_file")]
    pub commands_file: PathBuf,
    #[serde(default)]
    pub protocol: ProtocolVersion,
    #[serde(default)]
    pub fuzz: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub corpus_type: CorpusType,
    #[serde(default)]
    pub seed: Option<u64>,
}

pub fn default_target() -> String {
    "127.0.0.1:6379".to_string()
}

pub fn default_batches() -> u64 {
    1000
}

pub fn default_commands_file() -> PathBuf {
    PathBuf::from("./commands.txt")
}

fn default_timeout_ms() -> u64 {
    1000
}

pub fn default_output_dir() -> PathBuf {
    std::env::temp_dir()
}

impl FuzzerConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks the parameters a run cannot start without and returns the parsed target.
    pub fn validate(&self) -> Result<TargetAddr, ConfigError> {
        let target: TargetAddr = self.target.parse()?;
        if self.batches == 0 {
            return Err(ConfigError::InvalidBatchCount);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(target)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            batches: default_batches(),
            commands_file: default_commands_file(),
            protocol: ProtocolVersion::default(),
            fuzz: false,
            timeout_ms: default_timeout_ms(),
            output_dir: default_output_dir(),
            corpus_type: CorpusType::default(),
            seed: None,
        }
    }
}
