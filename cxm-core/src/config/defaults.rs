//! Default configuration values for cxm
//!
//! Values match the paths and ports of a stock xend installation.

use std::time::Duration;

// Cluster defaults
pub const DEFAULT_CLUSTER_NAME: &str = "cltest";
pub const DEFAULT_VMCONF_DIR: &str = "/etc/xen/vm/";
pub const DEFAULT_AUTOSTART_DIR: &str = "/etc/xen/auto/";
pub const DEFAULT_FENCE_CMD: &str = "/usr/local/sbin/fence.sh";

// Remote execution defaults
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_USER: &str = "root";
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";
pub const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_SSH_STDERR_TIMEOUT_SECS: u64 = 3;

// Xen-API defaults
pub const DEFAULT_XENAPI_SOCKET: &str = "/var/run/xend/xen-api.sock";
pub const DEFAULT_XENAPI_PORT: u16 = 9363;
pub const DEFAULT_XENAPI_USER: &str = "root";
pub const DEFAULT_XENAPI_PASSWORD: &str = "";

// Legacy XML-RPC defaults
pub const DEFAULT_LEGACY_SOCKET: &str = "/var/run/xend/xmlrpc.sock";
pub const DEFAULT_LEGACY_PORT: u16 = 8006;

// LVM defaults
pub const DEFAULT_LVM_REFRESH_GRACE_SECS: u64 = 60;

// VM lifecycle defaults
pub const DEFAULT_VM_LIST_CACHE_TTL_SECS: u64 = 5;
pub const DEFAULT_SHUTDOWN_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_SHUTDOWN_POLL_LIMIT: u32 = 50;

pub const fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
