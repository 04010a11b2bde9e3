use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::compensator::CompensatorConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub clock_sync: ClockSyncConfig,
    pub latency: LatencyConfig,
    pub scheduler: SchedulerSettings,
    pub compensator: CompensatorSettings,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub smoothing: f64, // EWMA weight of a new sample, 1.0 = latest only
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub lookahead_ms: f64,
    pub tick_interval_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensatorSettings {
    pub max_delay_s: f64,
    pub smoothing_ms: f64,
    pub default_volume: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub interval_ms: u64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        ClockSyncConfig {
            interval_ms: 10_000,
            timeout_ms: 3_000,
            smoothing: 1.0,
        }
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        LatencyConfig {
            interval_ms: 2_000,
            timeout_ms: 2_000,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            lookahead_ms: 100.0,
            tick_interval_ms: 25.0,
        }
    }
}

impl Default for CompensatorSettings {
    fn default() -> Self {
        CompensatorSettings {
            max_delay_s: 2.0,
            smoothing_ms: 75.0,
            default_volume: 100,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig { interval_ms: 10_000 }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config {}", path.display()))?;
        let config: SessionConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clock_sync.interval_ms == 0 || self.latency.interval_ms == 0 || self.status.interval_ms == 0 {
            return Err(anyhow!("Intervals must be non-zero"));
        }
        if !(self.clock_sync.smoothing > 0.0 && self.clock_sync.smoothing <= 1.0) {
            return Err(anyhow!("clock_sync.smoothing must be in (0, 1], got {}", self.clock_sync.smoothing));
        }
        if self.scheduler.tick_interval_ms <= 0.0 || self.scheduler.lookahead_ms <= self.scheduler.tick_interval_ms {
            return Err(anyhow!("scheduler.lookahead_ms must exceed a positive tick_interval_ms"));
        }
        if self.compensator.max_delay_s < 0.0 || self.compensator.smoothing_ms < 0.0 {
            return Err(anyhow!("Compensator bounds must be non-negative"));
        }
        if self.compensator.default_volume > 100 {
            return Err(anyhow!("compensator.default_volume must be 0..=100"));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            lookahead_s: self.scheduler.lookahead_ms / 1000.0,
            tick_interval_s: self.scheduler.tick_interval_ms / 1000.0,
        }
    }

    pub fn compensator_config(&self) -> CompensatorConfig {
        CompensatorConfig {
            max_delay_s: self.compensator.max_delay_s,
            smoothing_s: self.compensator.smoothing_ms / 1000.0,
        }
    }
}
