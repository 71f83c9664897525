use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use replcheck_report::NormalizerConfig;
use replcheck_transport::DoneMatching;

pub const RUNNER_CONFIG_SCHEMA_VERSION: u32 = 1;

/// Connection, deadline and normalizer settings for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    pub host: String,
    pub port: Option<u16>,
    pub connect_timeout_ms: u64,
    pub clone_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub drain_quiet_ms: u64,
    pub drain_max_ms: u64,
    pub done_matching: DoneMatching,
    #[serde(flatten)]
    pub normalizer: NormalizerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            connect_timeout_ms: 5_000,
            clone_timeout_ms: 10_000,
            call_timeout_ms: 10_000,
            poll_interval_ms: 25,
            poll_timeout_ms: 30_000,
            drain_quiet_ms: 200,
            drain_max_ms: 5_000,
            done_matching: DoneMatching::Correlated,
            normalizer: NormalizerConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("runner config host cannot be empty");
        }
        if self.port == Some(0) {
            bail!("runner config port must be greater than 0");
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("clone_timeout_ms", self.clone_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("drain_quiet_ms", self.drain_quiet_ms),
            ("drain_max_ms", self.drain_max_ms),
        ] {
            if value == 0 {
                bail!("runner config {name} must be greater than 0");
            }
        }
        if self.drain_max_ms < self.drain_quiet_ms {
            bail!(
                "runner config drain_max_ms ({}) must not be smaller than drain_quiet_ms ({})",
                self.drain_max_ms,
                self.drain_quiet_ms
            );
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_millis(self.clone_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_quiet(&self) -> Duration {
        Duration::from_millis(self.drain_quiet_ms)
    }

    pub fn drain_max(&self) -> Duration {
        Duration::from_millis(self.drain_max_ms)
    }
}

#[derive(Debug, Deserialize)]
struct RunnerConfigFile {
    schema_version: u32,
    #[serde(flatten)]
    config: RunnerConfig,
}

/// Loads a persisted runner config; a missing file yields the defaults.
pub fn load_runner_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        return Ok(RunnerConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read runner config {}", path.display()))?;
    let parsed = serde_json::from_str::<RunnerConfigFile>(&raw)
        .with_context(|| format!("failed to parse runner config {}", path.display()))?;
    if parsed.schema_version != RUNNER_CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported runner config schema_version {} in {} (expected {})",
            parsed.schema_version,
            path.display(),
            RUNNER_CONFIG_SCHEMA_VERSION
        );
    }
    parsed
        .config
        .validate()
        .with_context(|| format!("invalid runner config {}", path.display()))?;
    Ok(parsed.config)
}
