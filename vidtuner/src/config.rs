use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;

/// Config file read when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "vidtuner.yaml";

/// Shortest accepted scheduler tick.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

fn secs_to_delta(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: f64,
    /// Lead time before a scheduled switch at which it becomes due
    pub due_window_secs: u64,
    /// How long after a scheduled switch it is still worth firing
    pub play_window_secs: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        secs_to_duration(self.tick_interval_secs)
            .unwrap_or(Duration::from_secs(1))
            .max(MIN_TICK_INTERVAL)
    }

    /// Saturates at `TimeDelta::MAX` for windows chrono cannot represent
    pub fn due_window(&self) -> TimeDelta {
        secs_to_delta(self.due_window_secs).unwrap_or(TimeDelta::MAX)
    }

    pub fn play_window(&self) -> TimeDelta {
        secs_to_delta(self.play_window_secs).unwrap_or(TimeDelta::MAX)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1.0,
            due_window_secs: 15 * 60,
            play_window_secs: 105 * 60,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// Return the URI extracted from the watch page as-is
    Minimal,
    /// Fetch the extracted manifest and return its variants
    #[default]
    Extended,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    #[default]
    Http,
    Chrome,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub mode: ResolveMode,
    pub renderer: RendererKind,
    pub headless: bool,
    pub proxy: Option<String>,
    pub render_timeout_secs: f64,
    pub fetch_timeout_secs: f64,
    pub attempts: usize,
    pub retry_delays_ms: Vec<u64>,
    /// Replaces the built-in stream source pattern, must have a `src` group
    pub source_pattern: Option<String>,
}

impl ResolverConfig {
    pub fn render_timeout(&self) -> Duration {
        secs_to_duration(self.render_timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn fetch_timeout(&self) -> Duration {
        secs_to_duration(self.fetch_timeout_secs).unwrap_or(Duration::MAX)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: ResolveMode::Extended,
            renderer: RendererKind::Http,
            headless: true,
            proxy: None,
            render_timeout_secs: 30.0,
            fetch_timeout_secs: 10.0,
            attempts: 3,
            retry_delays_ms: vec![100, 500, 1000],
            source_pattern: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    /// Schedule file codes that refer to this channel
    #[serde(default)]
    pub codes: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Player program and arguments, `{uri}` is replaced with the stream URI
    pub command: Option<Vec<String>>,
    pub announce_delay_secs: f64,
}

impl PlaybackConfig {
    pub fn announce_delay(&self) -> Duration {
        secs_to_duration(self.announce_delay_secs).unwrap_or_default()
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            command: None,
            announce_delay_secs: 5.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub path: PathBuf,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("Schedule.txt"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub resolver: ResolverConfig,
    pub channels: Vec<ChannelConfig>,
    pub server: ServerConfig,
    pub playback: PlaybackConfig,
    pub schedule: ScheduleConfig,
    pub initial_channel: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            resolver: ResolverConfig::default(),
            channels: Vec::new(),
            server: ServerConfig::default(),
            playback: PlaybackConfig::default(),
            schedule: ScheduleConfig::default(),
            initial_channel: Some("bbc1".to_string()),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&file).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /**
        Load the config from an explicit path, or from the default path
        if it exists. Falls back to defaults when neither is present.
    */
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load_from_file(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from_file(DEFAULT_CONFIG_PATH)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tick = secs_to_duration(self.scheduler.tick_interval_secs);
        if !tick.is_some_and(|tick| tick >= MIN_TICK_INTERVAL) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.tick_interval_secs must be at least {MIN_TICK_INTERVAL:?}"
            )));
        }
        for (name, secs) in [
            ("scheduler.due_window_secs", self.scheduler.due_window_secs),
            ("scheduler.play_window_secs", self.scheduler.play_window_secs),
        ] {
            if secs_to_delta(secs).is_none() {
                return Err(ConfigError::Invalid(format!("{name} is out of range")));
            }
        }
        for (name, secs) in [
            ("resolver.render_timeout_secs", self.resolver.render_timeout_secs),
            ("resolver.fetch_timeout_secs", self.resolver.fetch_timeout_secs),
            ("playback.announce_delay_secs", self.playback.announce_delay_secs),
        ] {
            if secs_to_duration(secs).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number of seconds"
                )));
            }
        }
        if self.resolver.attempts == 0 {
            return Err(ConfigError::Invalid(
                "resolver.attempts must be at least 1".to_string(),
            ));
        }
        if let Some(command) = &self.playback.command
            && command.is_empty()
        {
            return Err(ConfigError::Invalid(
                "playback.command must name a program".to_string(),
            ));
        }
        Ok(())
    }
}
