//! Configuration management for fragment-speaker.
//!
//! Loads config from YAML files in standard locations. Every field has a
//! default, so a partial (or missing) file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub utterance_prefix: String,
    /// Consecutive failed deliveries of one fragment before giving up.
    pub max_attempts: u32,
    /// Per-word pacing of the console engine.
    pub word_delay_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            utterance_prefix: "fragment".into(),
            max_attempts: 3,
            word_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Empty means ~/.fragment-speaker-history
    pub dir: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: String::new(),
        }
    }
}

impl HistoryConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        if self.dir.is_empty() {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fragment-speaker-history")
        } else {
            PathBuf::from(&self.dir)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub speech: SpeechConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },
}

/// First existing file of ./config.yaml,
/// ~/.config/fragment-speaker/config.yaml, /etc/fragment-speaker/config.yaml.
pub fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok().map(|d| d.join("config.yaml"));
    let user = dirs::config_dir().map(|d| d.join("fragment-speaker").join("config.yaml"));
    let system = Some(PathBuf::from("/etc/fragment-speaker/config.yaml"));

    [cwd, user, system].into_iter().flatten().find(|p| p.is_file())
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, or the first file `find_config_file` turns up.
    /// Any problem is logged and yields the defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path.map(Path::to_path_buf).or_else(find_config_file) else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        Self::from_file(&path)
            .inspect(|_| info!("Loaded config from {}", path.display()))
            .unwrap_or_else(|e| {
                warn!("{e}, using defaults");
                Self::default()
            })
    }
}
