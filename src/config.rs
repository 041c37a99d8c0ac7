use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::WorkerEnv;
use crate::process::{MemoryLimit, ProcessExecutor, DEFAULT_GRACE_SECS, DEFAULT_MONITOR};
use crate::{plog_debug, plog_warn, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Worker count; defaults to the available parallelism.
    pub jobs: Option<usize>,
    /// Limit monitor, looked up on PATH when it is a bare name.
    pub monitor: Option<String>,
    pub temp_dir: Option<String>,
    pub log_file: Option<String>,
    /// Applied to manifest steps that set no timeout of their own.
    pub default_timeout_secs: Option<u64>,
    /// Applied to manifest steps that set no memory limit of their own.
    pub default_memlimit_mb: Option<u64>,
    pub grace_secs: Option<u64>,
}

impl Config {
    pub fn phasepool_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".phasepool"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::phasepool_dir()?.join("config.toml"))
    }

    /// Load `~/.phasepool/config.toml`, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        plog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            plog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load an explicitly named config file. A missing file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        if config.jobs == Some(0) {
            return Err(Error::Config("jobs must be at least 1".to_string()));
        }
        plog_debug!(
            "Config loaded: jobs={:?}, monitor={:?}, temp_dir={:?}",
            config.jobs,
            config.monitor,
            config.temp_dir
        );
        Ok(config)
    }

    pub fn effective_jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// The monitor binary. Bare names are resolved on PATH; a name that
    /// cannot be found is kept as is and fails when first used.
    pub fn effective_monitor(&self) -> PathBuf {
        let name = self.monitor.as_deref().unwrap_or(DEFAULT_MONITOR);
        if name.contains('/') || name.starts_with('~') {
            return expand_tilde(name);
        }
        match which::which(name) {
            Ok(path) => path,
            Err(e) => {
                plog_warn!("Monitor {} not found on PATH: {}", name, e);
                PathBuf::from(name)
            }
        }
    }

    pub fn effective_temp_dir(&self) -> PathBuf {
        match &self.temp_dir {
            Some(dir) => expand_tilde(dir),
            None => std::env::temp_dir().join("phasepool"),
        }
    }

    pub fn effective_log_file(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(expand_tilde)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs.unwrap_or(DEFAULT_GRACE_SECS))
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }

    pub fn default_memlimit(&self) -> Option<MemoryLimit> {
        self.default_memlimit_mb.map(MemoryLimit::from_mib)
    }

    pub fn executor(&self) -> ProcessExecutor {
        ProcessExecutor::new(self.effective_monitor()).with_grace(self.grace())
    }

    /// Environment shared by every worker of a run.
    pub fn worker_env(&self) -> WorkerEnv {
        WorkerEnv::new(self.executor(), self.effective_temp_dir())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
