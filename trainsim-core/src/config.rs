//! Configuration system for trainsim.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Files are
//! `~/.config/trainsim/config.toml` and `.trainsim/config.toml` in the
//! workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TrainingError};
use crate::gateway::GatewayConfig;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub progression: ProgressionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(TrainingError::invalid_input(
                "scheduler.tick_interval_ms must be positive",
            ));
        }
        if self.scheduler.max_active_runs == 0 {
            return Err(TrainingError::invalid_input(
                "scheduler.max_active_runs must be at least 1",
            ));
        }
        if self.scheduler.max_epochs == 0 {
            return Err(TrainingError::invalid_input(
                "scheduler.max_epochs must be at least 1",
            ));
        }
        let p = &self.progression;
        if !(p.ceiling > 0.0 && p.ceiling <= 1.0) {
            return Err(TrainingError::invalid_input(
                "progression.ceiling must be in (0, 1]",
            ));
        }
        if p.noise_amplitude < 0.0 || p.initial_loss < 0.0 || p.loss_decay < 0.0 {
            return Err(TrainingError::invalid_input(
                "progression noise, initial loss and decay must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Cadence and limits of the epoch scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wait between two epochs of one run, in milliseconds.
    pub tick_interval_ms: u64,
    /// Maximum number of runs progressing at the same time.
    pub max_active_runs: usize,
    /// Largest `epochs_total` accepted at creation.
    pub max_epochs: u32,
    /// Buffer size of the run event broadcast channel.
    pub event_capacity: usize,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_active_runs: 64,
            max_epochs: 10_000,
            event_capacity: 256,
        }
    }
}

/// Shape of the synthetic metric curves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressionConfig {
    /// Accuracy before the first epoch.
    pub baseline: f64,
    /// Accuracy gained over the whole run.
    pub spread: f64,
    /// Upper clamp for accuracy values.
    pub ceiling: f64,
    /// Half-width of the uniform accuracy noise.
    pub noise_amplitude: f64,
    pub initial_loss: f64,
    pub loss_decay: f64,
    /// Train/validation accuracy gap.
    pub val_gap: f64,
    pub seed: u64,
    pub base_latency_ms: f64,
    pub latency_per_sample_ms: f64,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            baseline: 0.5,
            spread: 0.4,
            ceiling: 0.95,
            noise_amplitude: 0.02,
            initial_loss: 2.3,
            loss_decay: 2.5,
            val_gap: 0.03,
            seed: 42,
            base_latency_ms: 12.0,
            latency_per_sample_ms: 0.25,
        }
    }
}

/// Which store backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for the file backend. Defaults to the platform data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(|| {
            directories::ProjectDirs::from("dev", "trainsim", "trainsim")
                .map(|d| d.data_dir().join("store"))
        })
    }
}

/// What to do at startup with runs whose scheduler died with the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Mark them failed.
    #[default]
    Fail,
    /// Mark them paused so they can be resumed.
    Pause,
    /// Drop their progress and return them to pending.
    Reset,
}

impl std::fmt::Display for ReconcilePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcilePolicy::Fail => write!(f, "fail"),
            ReconcilePolicy::Pause => write!(f, "pause"),
            ReconcilePolicy::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub on_restart: ReconcilePolicy,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TRAINSIM_`, `__` separates sections)
/// 3. Workspace-local config (`.trainsim/config.toml`)
/// 4. User config (`~/.config/trainsim/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> std::result::Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "trainsim", "trainsim") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".trainsim").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TRAINSIM_SCHEDULER__TICK_INTERVAL_MS, TRAINSIM_STORAGE__BACKEND, ...
    figment = figment.merge(Env::prefixed("TRAINSIM_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}
