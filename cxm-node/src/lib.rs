//! VM and storage lifecycle of the nodes of a Xen cluster
//!
//! Commands reach a node through an [`ExecutionChannel`] (in-process or over
//! SSH) and VM state through the Xen-API session of a [`HypervisorClient`].
//! [`Node`] combines both into the operations used by cluster tooling.

pub mod execution;
pub mod hypervisor;
pub mod node;
pub mod vm;
pub mod xmlrpc;

pub use execution::{CommandOutput, ExecutionChannel, LocalChannel, SshChannel, Transport};
pub use hypervisor::{
    DomainRecord, HypervisorClient, HypervisorSession, LegacyFactory, LegacyRpc, PowerState,
};
pub use node::{AutostartReport, HostList, LvReport, Node};
pub use vm::{Sxp, Vm, VmCatalog, VmMetrics, XmConfig};
