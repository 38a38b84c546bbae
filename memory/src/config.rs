use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use util::mib;

use crate::allocation::PriorityCutoff;
use crate::error::ConfigError;

/// Environment variable that pins the per-client budget, in mebibytes.
pub const FORCE_GPU_MEM_AVAILABLE_MB_ENV: &str = "OWL_FORCE_GPU_MEM_AVAILABLE_MB";

/// Platform family the budget policy is tuned for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Many windows can be visible at once; budgets are fixed and conservative.
    Desktop,
    /// One visible tab at a time; budgets follow what the device reports.
    Mobile,
}

impl Platform {
    /// Platform family of the build target.
    pub fn current() -> Self {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            Platform::Mobile
        } else {
            Platform::Desktop
        }
    }

    /// Cutoff handed to clients that own a surface.
    pub fn surface_priority_cutoff(self) -> PriorityCutoff {
        match self {
            Platform::Mobile => PriorityCutoff::AllowEverything,
            Platform::Desktop => PriorityCutoff::AllowNiceToHave,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

/// Tuning for the GPU memory manager.
///
/// Every field has a default, so a config file only lists what it overrides.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuMemoryConfig {
    pub platform: Platform,
    /// Surfaced clients (visible ones included) that keep a front buffer.
    pub max_surfaces_with_frontbuffer_soft_limit: usize,
    /// Growth past the historical peak that triggers a stats report.
    /// Also the width of the unmanaged-pool watermark band.
    pub bytes_allocated_step: u64,
    /// Debounce delay for deferred recompute passes.
    pub delayed_manage_timeout_ms: u64,
    /// Pins the per-client budget, ignoring any platform query.
    pub force_gpu_mem_available_mb: Option<u64>,
    pub desktop_client_hard_limit_bytes: u64,
    pub mobile_min_client_hard_limit_bytes: u64,
    pub mobile_max_client_hard_limit_bytes: u64,
}

impl Default for GpuMemoryConfig {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            max_surfaces_with_frontbuffer_soft_limit: 8,
            bytes_allocated_step: mib(16),
            delayed_manage_timeout_ms: 67,
            force_gpu_mem_available_mb: None,
            desktop_client_hard_limit_bytes: mib(512),
            mobile_min_client_hard_limit_bytes: mib(8),
            mobile_max_client_hard_limit_bytes: mib(512),
        }
    }
}

impl GpuMemoryConfig {
    /// Parses and validates a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Applies overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides looked up through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(FORCE_GPU_MEM_AVAILABLE_MB_ENV) {
            let value = raw.trim().parse::<u64>().map_err(|err| ConfigError::Invalid {
                key: FORCE_GPU_MEM_AVAILABLE_MB_ENV,
                reason: err.to_string(),
            })?;
            self.force_gpu_mem_available_mb = Some(value);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_surfaces_with_frontbuffer_soft_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "max_surfaces_with_frontbuffer_soft_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.bytes_allocated_step == 0 {
            return Err(ConfigError::Invalid {
                key: "bytes_allocated_step",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.mobile_min_client_hard_limit_bytes > self.mobile_max_client_hard_limit_bytes {
            return Err(ConfigError::Invalid {
                key: "mobile_min_client_hard_limit_bytes",
                reason: format!(
                    "{} exceeds mobile_max_client_hard_limit_bytes {}",
                    self.mobile_min_client_hard_limit_bytes, self.mobile_max_client_hard_limit_bytes
                ),
            });
        }
        Ok(())
    }

    pub fn delayed_manage_timeout(&self) -> Duration {
        Duration::from_millis(self.delayed_manage_timeout_ms)
    }

    /// Forced per-client budget in bytes, if configured.
    pub fn forced_client_hard_limit_bytes(&self) -> Option<u64> {
        self.force_gpu_mem_available_mb.map(mib)
    }

    /// Budget used before, or without, any platform query.
    pub fn initial_client_hard_limit_bytes(&self) -> u64 {
        if let Some(forced) = self.forced_client_hard_limit_bytes() {
            return forced;
        }
        match self.platform {
            Platform::Desktop => self.desktop_client_hard_limit_bytes,
            Platform::Mobile => self.mobile_min_client_hard_limit_bytes,
        }
    }
}
