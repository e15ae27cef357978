//! Hypervisor management interfaces
//!
//! A node talks to xend through two independent XML-RPC interfaces: the
//! Xen-API session used for every query and most lifecycle calls, and the
//! legacy interface used to create domains.

use crate::vm::{Sxp, VmMetrics};
use crate::xmlrpc::XmlRpcError;
use async_trait::async_trait;
use cxm_core::config::CxmConfig;
use cxm_core::error::{CxmError, CxmResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

mod legacy;
mod xenapi;

pub use legacy::XendLegacyClient;
pub use xenapi::XenApiSession;

/// Domain power state as reported by Xen-API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Halted,
    Paused,
    Running,
    Suspended,
    Crashed,
    Unknown,
}

impl PowerState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "halted" => PowerState::Halted,
            "paused" => PowerState::Paused,
            "running" => PowerState::Running,
            "suspended" => PowerState::Suspended,
            "crashed" => PowerState::Crashed,
            _ => PowerState::Unknown,
        }
    }

    /// Every state but `Halted` means the domain is instantiated
    pub fn is_started(&self) -> bool {
        *self != PowerState::Halted
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            PowerState::Halted => "Halted",
            PowerState::Paused => "Paused",
            PowerState::Running => "Running",
            PowerState::Suspended => "Suspended",
            PowerState::Crashed => "Crashed",
            PowerState::Unknown => "Unknown",
        };
        write!(f, "{}", state)
    }
}

/// The fields of a Xen-API VM record the node relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub reference: String,
    pub name_label: String,
    pub domid: i64,
    pub power_state: PowerState,
    /// Reference of the VM_metrics object
    pub metrics: String,
}

/// Primary session-oriented management API
#[async_trait]
pub trait HypervisorSession: Send + Sync {
    /// Reference of the first VM named `name`, if any
    async fn vm_by_name(&self, name: &str) -> CxmResult<Option<String>>;

    async fn power_state(&self, vm: &str) -> CxmResult<PowerState>;

    async fn vm_record(&self, vm: &str) -> CxmResult<DomainRecord>;

    async fn vm_metrics(&self, metrics: &str) -> CxmResult<VmMetrics>;

    async fn all_vm_records(&self) -> CxmResult<Vec<DomainRecord>>;

    /// Every VM_metrics object, keyed by reference
    async fn all_vm_metrics(&self) -> CxmResult<HashMap<String, VmMetrics>>;

    async fn clean_shutdown(&self, vm: &str) -> CxmResult<()>;

    async fn hard_shutdown(&self, vm: &str) -> CxmResult<()>;

    /// Live-migrate `vm` to the host named `destination`
    async fn migrate(&self, vm: &str, destination: &str) -> CxmResult<()>;

    async fn logout(&self) -> CxmResult<()>;
}

/// Legacy xend interface
#[async_trait]
pub trait LegacyRpc: Send + Sync {
    /// Create a paused domain from its description
    async fn domain_create(&self, description: &Sxp) -> CxmResult<()>;

    async fn domain_unpause(&self, domain: &str) -> CxmResult<()>;
}

/// Builds the legacy handle on first use
pub type LegacyFactory = Box<dyn Fn() -> CxmResult<Box<dyn LegacyRpc>> + Send + Sync>;

/// Both management interfaces of one node.
///
/// The primary session is logged in at construction. The legacy handle is
/// built the first time it is needed and kept for the lifetime of the client.
pub struct HypervisorClient {
    hostname: String,
    session: Box<dyn HypervisorSession>,
    legacy: OnceCell<Box<dyn LegacyRpc>>,
    legacy_factory: LegacyFactory,
}

impl HypervisorClient {
    pub fn new(
        hostname: impl Into<String>,
        session: Box<dyn HypervisorSession>,
        legacy_factory: LegacyFactory,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            session,
            legacy: OnceCell::new(),
            legacy_factory,
        }
    }

    /// Log into the node's Xen-API and prepare the legacy interface.
    ///
    /// Unix sockets are used for the local host, TCP otherwise.
    pub async fn connect(hostname: &str, is_local: bool, config: &Arc<CxmConfig>) -> CxmResult<Self> {
        let session = XenApiSession::login(hostname, is_local, &config.xenapi).await?;

        let host = hostname.to_string();
        let legacy_config = config.legacy.clone();
        let factory: LegacyFactory = Box::new(move || -> CxmResult<Box<dyn LegacyRpc>> {
            Ok(Box::new(XendLegacyClient::new(&host, is_local, &legacy_config)))
        });

        Ok(Self::new(hostname, Box::new(session), factory))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn session(&self) -> &dyn HypervisorSession {
        self.session.as_ref()
    }

    /// The legacy handle, created on first call
    pub async fn legacy(&self) -> CxmResult<&dyn LegacyRpc> {
        let legacy = self
            .legacy
            .get_or_try_init(|| async {
                debug!("[Legacy-API] {} -> opening handle", self.hostname);
                (self.legacy_factory)()
            })
            .await?;
        Ok(legacy.as_ref())
    }

    /// Close the primary session
    pub async fn close(&self) -> CxmResult<()> {
        self.session.logout().await
    }
}

impl fmt::Debug for HypervisorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HypervisorClient")
            .field("hostname", &self.hostname)
            .field("legacy_open", &self.legacy.initialized())
            .finish()
    }
}

/// Map a transport or protocol failure of `operation` to a node error
pub(crate) fn rpc_error(node: &str, operation: &str, err: XmlRpcError) -> CxmError {
    match err {
        XmlRpcError::Http(e) => CxmError::Connection {
            node: node.to_string(),
            details: e.to_string(),
        },
        XmlRpcError::Fault { code, message } => CxmError::Hypervisor {
            node: node.to_string(),
            operation: operation.to_string(),
            details: format!("fault {}: {}", code, message),
        },
        other => CxmError::Hypervisor {
            node: node.to_string(),
            operation: operation.to_string(),
            details: other.to_string(),
        },
    }
}
