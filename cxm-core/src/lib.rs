//! Shared building blocks for cxm, the clustered Xen manager
//!
//! This crate holds what every cluster member needs regardless of how it
//! reaches its hypervisor: the immutable configuration, the node-scoped error
//! taxonomy, the per-node result cache and the heartbeat message protocol.

pub mod caching;
pub mod config;
pub mod error;
pub mod logging;
pub mod messages;
pub mod resolver;

pub use caching::ResultCache;
pub use config::{CxmConfig, CxmConfigBuilder};
pub use error::{CxmError, CxmResult};
pub use messages::{
    Envelope, MasterHeartbeat, Message, MessageContext, MessageError, MessageHelper, MessageKind,
    ParseOutcome, Payload, SlaveHeartbeat,
};
pub use resolver::{HostResolver, StaticResolver, SystemResolver};
