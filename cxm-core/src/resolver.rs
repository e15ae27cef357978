//! Host name resolution seam
//!
//! Name caching and reverse lookups belong to the surrounding daemon; the
//! core only needs to know its own name and how to turn a transport-supplied
//! host identifier into a node name.

/// Resolves node names for the heartbeat protocol and for local-host checks
pub trait HostResolver: Send + Sync {
    /// Name of the host this process runs on
    fn local_name(&self) -> String;

    /// Node name for a host identifier supplied by the transport
    fn name_of(&self, host: &str) -> String;
}

/// Resolver backed by the system hostname. Host identifiers are used as-is.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn local_name(&self) -> String {
        local_hostname()
    }

    fn name_of(&self, host: &str) -> String {
        host.to_string()
    }
}

/// Resolver with a fixed local name, for hosts whose system hostname differs
/// from their cluster name
#[derive(Debug, Clone)]
pub struct StaticResolver {
    local: String,
}

impl StaticResolver {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
        }
    }
}

impl HostResolver for StaticResolver {
    fn local_name(&self) -> String {
        self.local.clone()
    }

    fn name_of(&self, host: &str) -> String {
        host.to_string()
    }
}

/// System hostname, lossily converted to UTF-8
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
