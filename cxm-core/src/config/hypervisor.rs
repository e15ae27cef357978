//! Hypervisor management interface configuration

use super::defaults::*;
use crate::error::{CxmError, CxmResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Primary session-oriented API (Xen-API)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct XenApiConfig {
    /// Unix socket used when the node is the local host
    pub socket: PathBuf,

    /// TCP port used for remote nodes
    pub port: u16,

    pub user: String,

    pub password: String,
}

impl Default for XenApiConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_XENAPI_SOCKET),
            port: DEFAULT_XENAPI_PORT,
            user: DEFAULT_XENAPI_USER.to_string(),
            password: DEFAULT_XENAPI_PASSWORD.to_string(),
        }
    }
}

/// Legacy XML-RPC interface of xend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LegacyRpcConfig {
    /// Unix socket used when the node is the local host
    pub socket: PathBuf,

    /// TCP port used for remote nodes
    pub port: u16,
}

impl Default for LegacyRpcConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_LEGACY_SOCKET),
            port: DEFAULT_LEGACY_PORT,
        }
    }
}

impl XenApiConfig {
    pub fn validate(&self) -> CxmResult<()> {
        if self.port == 0 {
            return Err(CxmError::ConfigError("xenapi.port must be non-zero".to_string()));
        }
        if self.user.is_empty() {
            return Err(CxmError::ConfigError("xenapi.user must not be empty".to_string()));
        }
        Ok(())
    }
}

impl LegacyRpcConfig {
    pub fn validate(&self) -> CxmResult<()> {
        if self.port == 0 {
            return Err(CxmError::ConfigError("legacy.port must be non-zero".to_string()));
        }
        Ok(())
    }
}
