use super::{rpc_error, LegacyRpc};
use crate::vm::Sxp;
use crate::xmlrpc::{RpcEndpoint, RpcTransport, Value};
use async_trait::async_trait;
use cxm_core::config::LegacyRpcConfig;
use cxm_core::error::CxmResult;
use tracing::debug;

/// Client of the legacy xend XML-RPC server
#[derive(Debug)]
pub struct XendLegacyClient {
    hostname: String,
    transport: RpcTransport,
}

impl XendLegacyClient {
    pub fn new(hostname: &str, is_local: bool, config: &LegacyRpcConfig) -> Self {
        let endpoint = RpcEndpoint::select(is_local, &config.socket, hostname, config.port);
        debug!("[Legacy-API] {} -> using {}", hostname, endpoint);

        Self {
            hostname: hostname.to_string(),
            transport: RpcTransport::new(endpoint),
        }
    }

    async fn invoke(&self, method: &str, params: &[Value]) -> CxmResult<Value> {
        debug!("[Legacy-API] {} -> {}", self.hostname, method);
        self.transport
            .call(method, params)
            .await
            .map_err(|e| rpc_error(&self.hostname, method, e))
    }
}

#[async_trait]
impl LegacyRpc for XendLegacyClient {
    async fn domain_create(&self, description: &Sxp) -> CxmResult<()> {
        debug!("[Legacy-API] {} config={}", self.hostname, description);
        self.invoke("xend.domain.create", &[description.to_value()])
            .await?;
        Ok(())
    }

    async fn domain_unpause(&self, domain: &str) -> CxmResult<()> {
        self.invoke("xend.domain.unpause", &[Value::from(domain)])
            .await?;
        Ok(())
    }
}
