use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Environment variable pointing at an alternative config file.
pub const CONFIG_ENV: &str = "SPAWN_SERVER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "spawn-server.toml";

const DEFAULT_KILL_TIMEOUT_MS: u64 = 5_000;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SpawnConfig {
    pub worker: WorkerConfig,
    pub proxy: ProxyConfig,
}

/// How worker processes are launched and when they count as ready.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable. Defaults to this binary's own `worker` command.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Extra environment variables, on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Wait for an application-level `ready` message instead of the generic
    /// `listening` signal.
    pub wait_for_ready: bool,
    /// Grace period between SIGTERM and a hard kill.
    pub kill_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            wait_for_ready: false,
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
        }
    }
}

impl WorkerConfig {
    /// A worker running `command` with `args`.
    pub fn command<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: Some(command.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Resolve the program and arguments to spawn.
    pub fn program(&self) -> std::io::Result<(PathBuf, Vec<String>)> {
        match &self.command {
            Some(command) => Ok((PathBuf::from(command), self.args.clone())),
            None => {
                let exe = std::env::current_exe()?;
                let mut args = vec!["worker".to_string()];
                args.extend(self.args.iter().cloned());
                Ok((exe, args))
            }
        }
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// How long a gated request may wait for a listening worker.
    pub ready_timeout_ms: Option<u64>,
}

impl ProxyConfig {
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }
}

impl SpawnConfig {
    /// Load from `$SPAWN_SERVER_CONFIG` or `spawn-server.toml`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
