//! Configuration for cxm
//!
//! A single immutable [`CxmConfig`] value is built once (from defaults, a TOML
//! file and `CXM_*` environment variables) and handed to every node at
//! construction. Nothing reads process-wide mutable flags.

use crate::error::{CxmError, CxmResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod defaults;
pub mod hypervisor;
pub mod ssh;
pub mod vm;

pub use defaults::*;
pub use hypervisor::{LegacyRpcConfig, XenApiConfig};
pub use ssh::SshConfig;
pub use vm::{LvmConfig, VmLifecycleConfig};

/// Root configuration structure for cxm
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CxmConfig {
    /// Name of the cluster this host belongs to
    pub cluster_name: String,

    /// Prefix prepended to every command issued on a node
    pub install_path: Option<PathBuf>,

    /// Directory holding the VM configuration files
    pub vmconf_dir: PathBuf,

    /// Directory holding the boot-time autostart links
    pub autostart_dir: PathBuf,

    /// Fencing command, called with the hostname as sole argument
    pub fence_cmd: String,

    /// Run every command through the remote session, even for the local host,
    /// and query VM state with shell commands instead of the management API
    pub use_ssh: bool,

    /// Never refresh volume group metadata
    pub no_refresh: bool,

    pub disable_fencing: bool,

    pub quiet: bool,

    pub debug: bool,

    pub ssh: SshConfig,

    pub xenapi: XenApiConfig,

    pub legacy: LegacyRpcConfig,

    pub lvm: LvmConfig,

    pub vm: VmLifecycleConfig,
}

impl Default for CxmConfig {
    fn default() -> Self {
        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            install_path: None,
            vmconf_dir: PathBuf::from(DEFAULT_VMCONF_DIR),
            autostart_dir: PathBuf::from(DEFAULT_AUTOSTART_DIR),
            fence_cmd: DEFAULT_FENCE_CMD.to_string(),
            use_ssh: false,
            no_refresh: false,
            disable_fencing: false,
            quiet: false,
            debug: false,
            ssh: SshConfig::default(),
            xenapi: XenApiConfig::default(),
            legacy: LegacyRpcConfig::default(),
            lvm: LvmConfig::default(),
            vm: VmLifecycleConfig::default(),
        }
    }
}

impl CxmConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing keys keep their default value.
    pub fn from_toml_str(content: &str) -> CxmResult<Self> {
        let config: CxmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> CxmResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CxmError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: CxmConfig = toml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> CxmResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CXM_*` environment variables
    pub fn apply_env(&mut self) -> CxmResult<()> {
        if let Ok(name) = std::env::var("CXM_CLUSTER_NAME") {
            self.cluster_name = name;
        }

        if let Ok(path) = std::env::var("CXM_PATH") {
            self.install_path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Ok(dir) = std::env::var("CXM_VMCONF_DIR") {
            self.vmconf_dir = PathBuf::from(dir);
        }

        if let Ok(cmd) = std::env::var("CXM_FENCE_CMD") {
            self.fence_cmd = cmd;
        }

        self.use_ssh = parse_bool_from_env("CXM_USESSH", self.use_ssh)?;
        self.no_refresh = parse_bool_from_env("CXM_NOREFRESH", self.no_refresh)?;
        self.disable_fencing = parse_bool_from_env("CXM_DISABLE_FENCING", self.disable_fencing)?;
        self.quiet = parse_bool_from_env("CXM_QUIET", self.quiet)?;
        self.debug = parse_bool_from_env("CXM_DEBUG", self.debug)?;

        self.ssh.apply_env()?;
        self.lvm.apply_env();
        self.vm.apply_env();

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> CxmResult<()> {
        if self.cluster_name.is_empty() {
            return Err(CxmError::ConfigError(
                "cluster_name must not be empty".to_string(),
            ));
        }

        if self.vmconf_dir.as_os_str().is_empty() {
            return Err(CxmError::ConfigError("vmconf_dir must not be empty".to_string()));
        }

        if self.autostart_dir.as_os_str().is_empty() {
            return Err(CxmError::ConfigError(
                "autostart_dir must not be empty".to_string(),
            ));
        }

        self.ssh.validate()?;
        self.xenapi.validate()?;
        self.legacy.validate()?;
        self.vm.validate()?;

        Ok(())
    }

    /// Create a test configuration rooted in a scratch directory
    pub fn test(root: &Path) -> Self {
        let mut config = Self::default();
        config.cluster_name = "test".to_string();
        config.vmconf_dir = root.join("vm");
        config.autostart_dir = root.join("auto");
        config.ssh.control_dir = root.to_path_buf();
        config
    }
}

/// Builder for CxmConfig
pub struct CxmConfigBuilder {
    config: CxmConfig,
}

impl CxmConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CxmConfig::default(),
        }
    }

    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.config.cluster_name = name.into();
        self
    }

    pub fn install_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.install_path = Some(path.into());
        self
    }

    pub fn vmconf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.vmconf_dir = dir.into();
        self
    }

    pub fn autostart_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.autostart_dir = dir.into();
        self
    }

    pub fn fence_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.config.fence_cmd = cmd.into();
        self
    }

    pub fn use_ssh(mut self, enabled: bool) -> Self {
        self.config.use_ssh = enabled;
        self
    }

    pub fn no_refresh(mut self, enabled: bool) -> Self {
        self.config.no_refresh = enabled;
        self
    }

    pub fn disable_fencing(mut self, disabled: bool) -> Self {
        self.config.disable_fencing = disabled;
        self
    }

    pub fn quiet(mut self, enabled: bool) -> Self {
        self.config.quiet = enabled;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    pub fn ssh(mut self, ssh: SshConfig) -> Self {
        self.config.ssh = ssh;
        self
    }

    pub fn lvm(mut self, lvm: LvmConfig) -> Self {
        self.config.lvm = lvm;
        self
    }

    pub fn vm(mut self, vm: VmLifecycleConfig) -> Self {
        self.config.vm = vm;
        self
    }

    pub fn build(self) -> CxmResult<CxmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for CxmConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn parse_bool_from_env(key: &str, default: bool) -> CxmResult<bool> {
    match std::env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(CxmError::ConfigError(format!("Invalid {}: {}", key, val))),
        },
        Err(_) => Ok(default),
    }
}
