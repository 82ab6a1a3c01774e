use std::error::Error;
use std::fmt;
use std::time::Duration;

use stackshot_types::MAX_BACKTRACE_DEPTH;

pub const MAX_DEPTH_ENV: &str = "STACKSHOT_MAX_DEPTH";
pub const SKIP_ENV: &str = "STACKSHOT_SKIP";
pub const SUSPEND_TIMEOUT_ENV: &str = "STACKSHOT_SUSPEND_TIMEOUT_MS";
pub const METADATA_REFRESH_ENV: &str = "STACKSHOT_METADATA_REFRESH_MS";
pub const IGNORED_THREADS_ENV: &str = "STACKSHOT_IGNORED_THREADS";

pub const DEFAULT_SUSPEND_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_METADATA_REFRESH_MS: u64 = 1_000;
pub const SAMPLER_THREAD_PREFIX: &str = "stackshot-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    pub max_depth: usize,
    pub skip: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_depth: MAX_BACKTRACE_DEPTH,
            skip: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    pub capture: CaptureOptions,
    /// How long to wait for a thread to stop before skipping it.
    pub suspend_timeout: Duration,
    /// `None` disables periodic re-resolution of cached thread metadata.
    pub metadata_refresh: Option<Duration>,
    pub ignored_thread_prefixes: Vec<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            capture: CaptureOptions::default(),
            suspend_timeout: Duration::from_millis(DEFAULT_SUSPEND_TIMEOUT_MS),
            metadata_refresh: Some(Duration::from_millis(DEFAULT_METADATA_REFRESH_MS)),
            ignored_thread_prefixes: vec![SAMPLER_THREAD_PREFIX.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidNumber { var: &'static str, value: String },
    DepthTooLarge { value: usize, max: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNumber { var, value } => {
                write!(f, "{var}={value:?} is not a non-negative integer")
            }
            Self::DepthTooLarge { value, max } => {
                write!(f, "{MAX_DEPTH_ENV}={value} exceeds the maximum depth of {max}")
            }
        }
    }
}

impl Error for ConfigError {}

impl SamplerConfig {
    /// Defaults overridden by `STACKSHOT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let number = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            let Some(value) = lookup(var)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
            else {
                return Ok(None);
            };
            value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidNumber { var, value })
        };

        if let Some(depth) = number(MAX_DEPTH_ENV)? {
            let depth = depth as usize;
            if depth > MAX_BACKTRACE_DEPTH {
                return Err(ConfigError::DepthTooLarge {
                    value: depth,
                    max: MAX_BACKTRACE_DEPTH,
                });
            }
            config.capture.max_depth = depth;
        }
        if let Some(skip) = number(SKIP_ENV)? {
            config.capture.skip = skip as usize;
        }
        if let Some(ms) = number(SUSPEND_TIMEOUT_ENV)? {
            config.suspend_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = number(METADATA_REFRESH_ENV)? {
            config.metadata_refresh = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(list) = lookup(IGNORED_THREADS_ENV) {
            config.ignored_thread_prefixes = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        Ok(config)
    }
}
