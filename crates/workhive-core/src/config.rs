//! Work queue and executor configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// How a work item's action executes relative to the host and its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationStrategy {
    /// Inline on a pooled thread, sharing the host's state.
    None,
    /// Pooled thread with a dedicated execution context per config.
    IsolatedContext,
    /// Dedicated daemon process from the daemon pool.
    IsolatedProcess,
}

impl fmt::Display for IsolationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationStrategy::None => "none",
            IsolationStrategy::IsolatedContext => "isolated-context",
            IsolationStrategy::IsolatedProcess => "isolated-process",
        };
        f.write_str(name)
    }
}

/// Settings for an isolated execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ContextOptions {
    /// Dynamic libraries loaded privately into the context.
    pub library_paths: Vec<PathBuf>,
    /// Free-form settings visible to actions running in the context.
    pub settings: BTreeMap<String, String>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_paths.push(path.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        for path in &self.library_paths {
            if !path.is_file() {
                return Err(Error::Configuration(format!(
                    "context library not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Startup options for daemon processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProcessOptions {
    /// Daemon executable. Discovered automatically when unset.
    pub program: Option<PathBuf>,
    /// Extra command-line arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory of the daemon.
    pub working_dir: Option<PathBuf>,
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(program) = &self.program
            && !program.is_file()
        {
            return Err(Error::Configuration(format!(
                "daemon program not found: {}",
                program.display()
            )));
        }
        if let Some(dir) = &self.working_dir
            && !dir.is_dir()
        {
            return Err(Error::Configuration(format!(
                "daemon working directory not found: {}",
                dir.display()
            )));
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(Error::Configuration(format!(
                    "invalid daemon environment variable name: {:?}",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Strategy plus strategy-specific settings, bound to a work queue.
///
/// Two configs may share a slot iff they are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum WorkQueueConfig {
    #[default]
    None,
    IsolatedContext(ContextOptions),
    IsolatedProcess(ProcessOptions),
}

impl WorkQueueConfig {
    pub fn strategy(&self) -> IsolationStrategy {
        match self {
            WorkQueueConfig::None => IsolationStrategy::None,
            WorkQueueConfig::IsolatedContext(_) => IsolationStrategy::IsolatedContext,
            WorkQueueConfig::IsolatedProcess(_) => IsolationStrategy::IsolatedProcess,
        }
    }

    /// Whether items of both configs may run on the same slot.
    pub fn is_compatible_with(&self, other: &WorkQueueConfig) -> bool {
        self == other
    }

    /// Check settings that are detectable before any work runs.
    pub fn validate(&self) -> Result<()> {
        match self {
            WorkQueueConfig::None => Ok(()),
            WorkQueueConfig::IsolatedContext(options) => options.validate(),
            WorkQueueConfig::IsolatedProcess(options) => options.validate(),
        }
    }
}

/// Bounds and timings for the daemon pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPoolConfig {
    /// Upper bound on live daemons sharing one config.
    pub max_daemons_per_config: usize,
    /// Upper bound on live daemons across all configs.
    pub max_daemons: usize,
    /// Idle daemons older than this are reaped.
    pub idle_timeout: Duration,
    /// How often the reaper wakes up.
    pub reap_interval: Duration,
    /// How long a new daemon may take to answer its readiness ping.
    pub startup_timeout: Duration,
}

impl Default for DaemonPoolConfig {
    fn default() -> Self {
        Self {
            max_daemons_per_config: 4,
            max_daemons: 8,
            idle_timeout: Duration::from_secs(180),
            reap_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl DaemonPoolConfig {
    pub fn with_max_daemons_per_config(mut self, max: usize) -> Self {
        self.max_daemons_per_config = max;
        self
    }

    pub fn with_max_daemons(mut self, max: usize) -> Self {
        self.max_daemons = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_daemons == 0 || self.max_daemons_per_config == 0 {
            return Err(Error::Configuration(
                "daemon pool bounds must be at least 1".to_string(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(Error::Configuration(
                "reap interval must be non-zero".to_string(),
            ));
        }
        if self.startup_timeout.is_zero() {
            return Err(Error::Configuration(
                "daemon startup timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Worker threads for in-process strategies.
    pub max_workers: usize,
    /// Daemon pool settings, used when the executor owns its pool.
    pub daemons: DaemonPoolConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let max_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_workers,
            daemons: DaemonPoolConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `WORKHIVE_*` environment variables.
    ///
    /// Recognized: `WORKHIVE_MAX_WORKERS`, `WORKHIVE_MAX_DAEMONS`,
    /// `WORKHIVE_DAEMON_IDLE_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(n) = parse_var(&lookup, "WORKHIVE_MAX_WORKERS")? {
            config.max_workers = n as usize;
        }
        if let Some(n) = parse_var(&lookup, "WORKHIVE_MAX_DAEMONS")? {
            config.daemons.max_daemons = n as usize;
        }
        if let Some(secs) = parse_var(&lookup, "WORKHIVE_DAEMON_IDLE_TIMEOUT_SECS")? {
            config.daemons.idle_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_daemons(mut self, daemons: DaemonPoolConfig) -> Self {
        self.daemons = daemons;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Configuration(
                "max_workers must be at least 1".to_string(),
            ));
        }
        self.daemons.validate()
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Configuration(format!("{}={:?}: {}", key, raw, e))),
    }
}
