//! Configuration for a Strand consumer.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $STRAND_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/strand/config.toml
//!   3. ~/.config/strand/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrandConfig {
    pub fetch: FetchConfig,
    pub buffer: BufferConfig,
    pub drd: DrdConfig,
    pub playout: PlayoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Lifetime stamped on every request, and the upper bound of the
    /// retransmission deadline.
    pub request_lifetime_ms: u64,
    /// Reissues per request before it is reported lost.
    pub max_retries: u32,
    /// Floor of the retransmission deadline.
    pub min_deadline_ms: u64,
    /// Token rate for reissued requests. 0 = unlimited.
    pub retransmissions_per_sec: u32,
    /// Upper limit of the outstanding sample window.
    pub max_pipeline: u32,
    /// No sample for this long sends the pipeline back to bootstrap.
    pub starvation_ms: u64,
    /// Control loop tick.
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Samples kept per thread and class before the oldest are evicted.
    pub horizon: u32,
    /// How long playout waits on an incomplete head sample before skipping it.
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrdConfig {
    /// Number of delay samples averaged per estimate.
    pub window: u32,
    /// Reported until the first sample arrives.
    pub initial_drd_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// How often playout looks at the buffer when nothing is ready.
    pub tick_ms: u64,
    /// Apply drift correction against a master stream when one is attached.
    pub av_sync: bool,
    /// Reusable sample containers. 0 = unbounded.
    pub pool_capacity: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_lifetime_ms: 2000,
            max_retries: 3,
            min_deadline_ms: 50,
            retransmissions_per_sec: 50,
            max_pipeline: 30,
            starvation_ms: 3000,
            tick_ms: 10,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            horizon: 60,
            jitter_ms: 150,
        }
    }
}

impl Default for DrdConfig {
    fn default() -> Self {
        Self {
            window: 30,
            initial_drd_ms: 150.0,
        }
    }
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5,
            av_sync: true,
            pool_capacity: 32,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("strand")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl StrandConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            StrandConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("STRAND_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&StrandConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply STRAND_* overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &'static str, v: String) -> Result<T, ConfigError> {
            v.parse().map_err(|_| ConfigError::InvalidValue(key, v))
        }

        if let Some(v) = lookup("STRAND_FETCH__REQUEST_LIFETIME_MS") {
            self.fetch.request_lifetime_ms = parse("fetch.request_lifetime_ms", v)?;
        }
        if let Some(v) = lookup("STRAND_FETCH__MAX_RETRIES") {
            self.fetch.max_retries = parse("fetch.max_retries", v)?;
        }
        if let Some(v) = lookup("STRAND_FETCH__RETRANSMISSIONS_PER_SEC") {
            self.fetch.retransmissions_per_sec = parse("fetch.retransmissions_per_sec", v)?;
        }
        if let Some(v) = lookup("STRAND_FETCH__MAX_PIPELINE") {
            self.fetch.max_pipeline = parse("fetch.max_pipeline", v)?;
        }
        if let Some(v) = lookup("STRAND_BUFFER__HORIZON") {
            self.buffer.horizon = parse("buffer.horizon", v)?;
        }
        if let Some(v) = lookup("STRAND_BUFFER__JITTER_MS") {
            self.buffer.jitter_ms = parse("buffer.jitter_ms", v)?;
        }
        if let Some(v) = lookup("STRAND_DRD__INITIAL_DRD_MS") {
            self.drd.initial_drd_ms = parse("drd.initial_drd_ms", v)?;
        }
        if let Some(v) = lookup("STRAND_PLAYOUT__AV_SYNC") {
            self.playout.av_sync = v == "true" || v == "1";
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.max_pipeline == 0 {
            return Err(ConfigError::InvalidValue("fetch.max_pipeline", "0".into()));
        }
        if self.fetch.min_deadline_ms > self.fetch.request_lifetime_ms {
            return Err(ConfigError::InvalidValue(
                "fetch.min_deadline_ms",
                format!(
                    "{} exceeds request lifetime {}",
                    self.fetch.min_deadline_ms, self.fetch.request_lifetime_ms
                ),
            ));
        }
        if self.drd.window == 0 {
            return Err(ConfigError::InvalidValue("drd.window", "0".into()));
        }
        if self.buffer.horizon == 0 {
            return Err(ConfigError::InvalidValue("buffer.horizon", "0".into()));
        }
        Ok(())
    }
}
