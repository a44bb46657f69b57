//! Agent configuration.
//!
//! Read from the `-agentpath` option string, optionally pointing at a TOML
//! file with `config=<path>`. Options given inline override the file.
//!
//! ```toml
//! mode = "timing"
//! include = ["com\\.example\\..*"]
//! exclude = ["com\\.example\\.generated\\..*"]
//! report = "/tmp/delver-report.csv"
//! log_level = "info"
//!
//! [snapshot]
//! enabled = true
//! initial_delay_secs = 60
//! period_secs = 300
//! directory = "/var/tmp/delver"
//! ```

use crate::metrics::ProbeMode;
use crate::policy::{InclusionPolicy, PatternPolicy};
use crate::snapshot::SnapshotConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid class pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    mode: Option<ProbeMode>,
    include: Vec<String>,
    exclude: Vec<String>,
    report: Option<PathBuf>,
    log_level: Option<String>,
    snapshot: SnapshotSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SnapshotSection {
    enabled: Option<bool>,
    initial_delay_secs: Option<u64>,
    period_secs: Option<u64>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub mode: ProbeMode,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub snapshot_enabled: bool,
    pub snapshot: SnapshotConfig,
    /// Full report written at VM death.
    pub report: Option<PathBuf>,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::default(),
            include: Vec::new(),
            exclude: Vec::new(),
            snapshot_enabled: true,
            snapshot: SnapshotConfig::default(),
            report: None,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Parses `key=value[,key=value...]`.
    ///
    /// A `,` only starts a new option when a known key follows it. Anything
    /// else belongs to the `include` or `exclude` pattern before it, so
    /// `include=a{1,3}` keeps its repetition.
    pub fn parse_options(options: &str) -> Result<Self> {
        let pairs = split_options(options)?;

        let mut config = match pairs.iter().find(|(key, _)| *key == "config") {
            Some((_, path)) => Self::from_file(Path::new(path))?,
            None => Self::default(),
        };

        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for (key, value) in pairs {
            let value = value.as_str();
            match key {
                "config" => {}
                "include" => include.push(value.to_string()),
                "exclude" => exclude.push(value.to_string()),
                "mode" => {
                    config.mode = ProbeMode::parse(value)
                        .ok_or_else(|| ConfigError::InvalidOption(format!("mode={value}")))?;
                }
                "snapshot" => {
                    config.snapshot_enabled = match value {
                        "on" | "true" => true,
                        "off" | "false" => false,
                        _ => return Err(ConfigError::InvalidOption(format!("snapshot={value}"))),
                    };
                }
                "report" => config.report = Some(PathBuf::from(value)),
                "log" => config.log_level = value.to_string(),
                _ => return Err(ConfigError::InvalidOption(format!("{key}={value}"))),
            }
        }
        if !include.is_empty() {
            config.include = include;
        }
        if !exclude.is_empty() {
            config.exclude = exclude;
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(text)?;
        let mut config = Self::default();
        if let Some(mode) = file.mode {
            config.mode = mode;
        }
        config.include = file.include;
        config.exclude = file.exclude;
        config.report = file.report;
        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        if let Some(enabled) = file.snapshot.enabled {
            config.snapshot_enabled = enabled;
        }
        if let Some(secs) = file.snapshot.initial_delay_secs {
            config.snapshot.initial_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = file.snapshot.period_secs {
            config.snapshot.period = Duration::from_secs(secs.max(1));
        }
        config.snapshot.directory = file.snapshot.directory;
        Ok(config)
    }

    /// The inclusion policy, or `None` when no pattern was configured.
    pub fn policy(&self) -> Result<Option<Arc<dyn InclusionPolicy>>> {
        if self.include.is_empty() && self.exclude.is_empty() {
            return Ok(None);
        }
        let policy = PatternPolicy::new(&self.include, &self.exclude)?;
        Ok(Some(Arc::new(policy)))
    }

    /// Like [`policy`](Self::policy), for the agent's own run. Without a
    /// policy nothing is instrumented, so snapshots are switched off too.
    pub fn resolve_policy(&mut self) -> Result<Option<Arc<dyn InclusionPolicy>>> {
        let policy = self.policy();
        if !matches!(policy, Ok(Some(_))) {
            self.snapshot_enabled = false;
        }
        policy
    }
}

const OPTION_KEYS: [&str; 7] = ["config", "include", "exclude", "mode", "snapshot", "report", "log"];

fn split_options(options: &str) -> Result<Vec<(&str, String)>> {
    let mut pairs: Vec<(&str, String)> = Vec::new();
    for piece in options.split(',') {
        if piece.trim().is_empty() {
            continue;
        }
        if let Some((key, value)) = piece.split_once('=') {
            if let Some(key) = OPTION_KEYS.iter().copied().find(|k| *k == key.trim()) {
                pairs.push((key, value.trim().to_string()));
                continue;
            }
        }
        match pairs.last_mut() {
            Some((key, value)) if *key == "include" || *key == "exclude" => {
                value.push(',');
                value.push_str(piece.trim_end());
            }
            _ => return Err(ConfigError::InvalidOption(piece.trim().to_string())),
        }
    }
    Ok(pairs)
}
