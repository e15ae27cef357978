//! VM lifecycle and storage configuration

use super::defaults::*;
use super::parse_duration_secs_from_env;
use crate::error::{CxmError, CxmResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical volume manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LvmConfig {
    /// Minimum delay between two metadata refreshes on the same node
    #[serde(with = "humantime_serde")]
    pub refresh_grace: Duration,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            refresh_grace: duration_secs(DEFAULT_LVM_REFRESH_GRACE_SECS),
        }
    }
}

/// VM inventory and shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VmLifecycleConfig {
    /// Time a VM listing stays cached
    #[serde(with = "humantime_serde")]
    pub list_cache_ttl: Duration,

    /// Delay between two checks while waiting for a VM to go down
    #[serde(with = "humantime_serde")]
    pub shutdown_poll_interval: Duration,

    /// Number of checks before giving up waiting
    pub shutdown_poll_limit: u32,
}

impl Default for VmLifecycleConfig {
    fn default() -> Self {
        Self {
            list_cache_ttl: duration_secs(DEFAULT_VM_LIST_CACHE_TTL_SECS),
            shutdown_poll_interval: duration_secs(DEFAULT_SHUTDOWN_POLL_INTERVAL_SECS),
            shutdown_poll_limit: DEFAULT_SHUTDOWN_POLL_LIMIT,
        }
    }
}

impl LvmConfig {
    pub fn apply_env(&mut self) {
        self.refresh_grace = parse_duration_secs_from_env("CXM_LVM_REFRESH_GRACE", self.refresh_grace);
    }
}

impl VmLifecycleConfig {
    pub fn apply_env(&mut self) {
        self.list_cache_ttl = parse_duration_secs_from_env("CXM_VM_LIST_CACHE_TTL", self.list_cache_ttl);
    }

    pub fn validate(&self) -> CxmResult<()> {
        if self.shutdown_poll_interval.is_zero() {
            return Err(CxmError::ConfigError(
                "vm.shutdown_poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
