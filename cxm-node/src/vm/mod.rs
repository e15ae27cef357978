//! VM records and configuration files

mod catalog;
mod xmconfig;

pub use catalog::VmCatalog;
pub use xmconfig::{Sxp, XmConfig, XmValue};

use std::fmt;

/// Resource usage reported by the hypervisor for a running domain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmMetrics {
    /// Memory currently allocated, in bytes
    pub memory_actual: u64,
    pub vcpus_number: u32,
}

/// A running VM as seen from one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vm {
    pub name: String,
    /// Hypervisor domain id
    pub id: i64,
    /// Allocated memory, in megabytes
    pub ram: u64,
    pub vcpu: u32,
    /// Metrics reference and values, when queried through the management API
    pub metrics: Option<VmMetrics>,
}

impl Vm {
    pub fn new(name: impl Into<String>, id: i64, ram: u64, vcpu: u32) -> Self {
        Self {
            name: name.into(),
            id,
            ram,
            vcpu,
            metrics: None,
        }
    }

    /// Build a VM from hypervisor metrics. RAM and vCPU count are taken from
    /// the metrics.
    pub fn with_metrics(name: impl Into<String>, id: i64, metrics: VmMetrics) -> Self {
        Self {
            name: name.into(),
            id,
            ram: metrics.memory_actual / (1024 * 1024),
            vcpu: metrics.vcpus_number,
            metrics: Some(metrics),
        }
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<VM Instance: {}>", self.name)
    }
}
