//! Remote execution configuration

use super::defaults::*;
use super::parse_duration_secs_from_env;
use crate::error::{CxmError, CxmResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the persistent remote execution session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// Port of the remote shell daemon
    pub port: u16,

    /// Administrative identity used to log in
    pub user: String,

    /// OpenSSH client binary, looked up in `PATH` when not absolute
    pub program: PathBuf,

    /// Timeout when establishing the session
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Bounded read applied to the error stream after a non-zero exit
    #[serde(with = "humantime_serde")]
    pub stderr_timeout: Duration,

    /// Directory holding the session control sockets
    pub control_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            user: DEFAULT_SSH_USER.to_string(),
            program: PathBuf::from(DEFAULT_SSH_PROGRAM),
            connect_timeout: duration_secs(DEFAULT_SSH_CONNECT_TIMEOUT_SECS),
            stderr_timeout: duration_secs(DEFAULT_SSH_STDERR_TIMEOUT_SECS),
            control_dir: std::env::temp_dir(),
        }
    }
}

impl SshConfig {
    pub fn apply_env(&mut self) -> CxmResult<()> {
        if let Ok(val) = std::env::var("CXM_SSH_PORT") {
            self.port = val
                .parse()
                .map_err(|_| CxmError::ConfigError("Invalid CXM_SSH_PORT".to_string()))?;
        }

        if let Ok(user) = std::env::var("CXM_SSH_USER") {
            self.user = user;
        }

        if let Ok(program) = std::env::var("CXM_SSH_PROGRAM") {
            self.program = PathBuf::from(program);
        }

        self.connect_timeout =
            parse_duration_secs_from_env("CXM_SSH_CONNECT_TIMEOUT", self.connect_timeout);
        self.stderr_timeout =
            parse_duration_secs_from_env("CXM_SSH_STDERR_TIMEOUT", self.stderr_timeout);

        Ok(())
    }

    pub fn validate(&self) -> CxmResult<()> {
        if self.port == 0 {
            return Err(CxmError::ConfigError("ssh.port must be non-zero".to_string()));
        }

        if self.user.is_empty() {
            return Err(CxmError::ConfigError("ssh.user must not be empty".to_string()));
        }

        if self.program.as_os_str().is_empty() {
            return Err(CxmError::ConfigError("ssh.program must not be empty".to_string()));
        }

        if self.stderr_timeout.is_zero() {
            return Err(CxmError::ConfigError(
                "ssh.stderr_timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
