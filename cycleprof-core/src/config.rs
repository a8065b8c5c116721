use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ProfilerError, ProfilerResult};
use crate::ring_buffer::MAX_CAPACITY;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Runtime parameters of the profiler component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Flush timer period
    pub interval: Duration,
    /// Consecutive empty flushes before the timer is disarmed
    pub idle_threshold: u32,
    /// Queue fill in bytes above which the producer asks for a flush
    pub flush_threshold: usize,
    /// Ring capacity in bytes
    pub buffer_capacity: usize,
    /// Largest single record in bytes
    pub scratch_size: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            idle_threshold: 5,
            flush_threshold: 16 * 1024,
            buffer_capacity: 8 * 1024 * 1024,
            scratch_size: 16 * 1024,
        }
    }
}

impl ProfilerConfig {
    pub fn validate(&self) -> ProfilerResult {
        if !self.buffer_capacity.is_power_of_two() {
            return Err(ProfilerError::InvalidConfig(format!(
                "buffer_capacity {} is not a power of two",
                self.buffer_capacity
            )));
        }
        if self.buffer_capacity > MAX_CAPACITY {
            return Err(ProfilerError::InvalidConfig(format!(
                "buffer_capacity {} exceeds {}",
                self.buffer_capacity, MAX_CAPACITY
            )));
        }
        if self.scratch_size == 0 || self.scratch_size > self.buffer_capacity {
            return Err(ProfilerError::InvalidConfig(format!(
                "scratch_size {} must be within 1..={}",
                self.scratch_size, self.buffer_capacity
            )));
        }
        if self.interval.is_zero() {
            return Err(ProfilerError::InvalidConfig("interval must be non-zero".into()));
        }
        if self.idle_threshold == 0 {
            return Err(ProfilerError::InvalidConfig(
                "idle_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    profiler: ProfilerSection,
    #[serde(default)]
    server: ServerSection,
}

#[derive(Deserialize, Default)]
struct ProfilerSection {
    interval_ms: Option<u64>,
    idle_threshold: Option<u32>,
    flush_threshold: Option<usize>,
    buffer_capacity: Option<usize>,
    scratch_size: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ServerSection {
    listen: Option<String>,
    max_subscribers: Option<usize>,
}

pub struct Config {
    profiler: ProfilerSection,
    server: ServerSection,
}

impl Config {
    /// Embedded defaults overlaid by the user's config file, if any.
    pub fn load() -> Self {
        let mut config = Self::embedded();
        if let Some(path) = user_config_path() {
            if path.exists() {
                config.overlay_file(&path);
            }
        }
        config
    }

    /// Embedded defaults overlaid by `path`.
    pub fn load_from(path: &Path) -> Self {
        let mut config = Self::embedded();
        config.overlay_file(path);
        config
    }

    fn embedded() -> Self {
        let base: ConfigFile = match toml::from_str(DEFAULT_CONFIG) {
            Ok(base) => base,
            Err(e) => {
                log::error!(target: "config", "embedded config.toml is malformed: {}", e);
                ConfigFile::default()
            }
        };
        Config {
            profiler: base.profiler,
            server: base.server,
        }
    }

    fn overlay_file(&mut self, path: &Path) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                Ok(user) => {
                    merge_profiler(&mut self.profiler, user.profiler);
                    merge_server(&mut self.server, user.server);
                }
                Err(e) => {
                    log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                }
            },
            Err(e) => {
                log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
            }
        }
    }

    /// Profiler parameters. Values that do not validate fall back to defaults.
    pub fn profiler_config(&self) -> ProfilerConfig {
        let fallback = ProfilerConfig::default();
        let p = &self.profiler;
        let config = ProfilerConfig {
            interval: p
                .interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback.interval),
            idle_threshold: p
                .idle_threshold
                .filter(|n| *n > 0)
                .unwrap_or(fallback.idle_threshold),
            flush_threshold: p.flush_threshold.unwrap_or(fallback.flush_threshold),
            buffer_capacity: p
                .buffer_capacity
                .filter(|c| c.is_power_of_two() && *c <= MAX_CAPACITY)
                .unwrap_or(fallback.buffer_capacity),
            scratch_size: p.scratch_size.unwrap_or(fallback.scratch_size),
        };
        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                log::warn!(target: "config", "{}, using defaults", e);
                fallback
            }
        }
    }

    pub fn server_listen(&self) -> String {
        self.server
            .listen
            .clone()
            .unwrap_or_else(|| "127.0.0.1:4713".to_string())
    }

    /// Subscriber limit of the network host. `None` is unlimited.
    pub fn max_subscribers(&self) -> Option<usize> {
        self.server.max_subscribers
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cycleprof").join("config.toml"))
}

fn merge_profiler(base: &mut ProfilerSection, user: ProfilerSection) {
    if user.interval_ms.is_some() {
        base.interval_ms = user.interval_ms;
    }
    if user.idle_threshold.is_some() {
        base.idle_threshold = user.idle_threshold;
    }
    if user.flush_threshold.is_some() {
        base.flush_threshold = user.flush_threshold;
    }
    if user.buffer_capacity.is_some() {
        base.buffer_capacity = user.buffer_capacity;
    }
    if user.scratch_size.is_some() {
        base.scratch_size = user.scratch_size;
    }
}

fn merge_server(base: &mut ServerSection, user: ServerSection) {
    if user.listen.is_some() {
        base.listen = user.listen;
    }
    if user.max_subscribers.is_some() {
        base.max_subscribers = user.max_subscribers;
    }
}
