use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Timeouts for remote downloads.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// The upper limit for one complete download, regardless of how fast the
    /// remote responds.
    #[serde(with = "humantime_serde")]
    pub max_download: Duration,
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            // Allow a 4MB/s connection to download 1GB without timing out
            max_download: Duration::from_secs(315),
        }
    }
}

/// Service configuration, consumed as plain values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for persistent caches. Will be created if it does not
    /// exist.
    ///
    /// Leaving this as `None` disables the persistent layer.
    pub cache_dir: Option<PathBuf>,

    /// Subdirectory of `cache_dir` holding the image values and the journal.
    pub cache_subdir: String,

    /// Byte budget of the in-memory cache of decoded images.
    ///
    /// A reasonable value is an eighth of the memory the process is expected
    /// to keep resident.
    pub memory_budget_bytes: u64,

    /// Byte budget of the persistent cache.
    pub disk_budget_bytes: u64,

    /// Number of workers that fetch and decode jobs run on.
    pub worker_threads: usize,

    /// Timeouts for remote downloads.
    pub timeouts: DownloadTimeouts,

    /// Logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            cache_subdir: "thumbnails".into(),
            memory_budget_bytes: 64 * 1024 * 1024,
            disk_budget_bytes: 20 * 1024 * 1024,
            worker_threads: num_cpus::get(),
            timeouts: DownloadTimeouts::default(),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file, or the defaults if no path
    /// is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let source = fs::read_to_string(path)
                    .context("failed to open config file")?;
                serde_yaml::from_str(&source).context("failed to parse YAML config")
            }
            None => Ok(Config::default()),
        }
    }

    /// The directory the persistent image cache lives in, if it is enabled.
    pub fn disk_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(&self.cache_subdir))
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(de::Error::custom)
}
