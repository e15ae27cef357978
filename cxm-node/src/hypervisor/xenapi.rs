use super::{rpc_error, DomainRecord, HypervisorSession, PowerState};
use crate::vm::VmMetrics;
use crate::xmlrpc::{RpcEndpoint, RpcTransport, Value};
use async_trait::async_trait;
use cxm_core::config::XenApiConfig;
use cxm_core::error::{CxmError, CxmResult};
use std::collections::HashMap;
use tracing::debug;

/// Logged-in Xen-API session
#[derive(Debug)]
pub struct XenApiSession {
    hostname: String,
    transport: RpcTransport,
    session: String,
}

impl XenApiSession {
    pub async fn login(hostname: &str, is_local: bool, config: &XenApiConfig) -> CxmResult<Self> {
        let endpoint = RpcEndpoint::select(is_local, &config.socket, hostname, config.port);
        debug!("[API] {} -> using {}", hostname, endpoint);

        let transport = RpcTransport::new(endpoint);
        let operation = "session.login_with_password";
        let response = transport
            .call(
                operation,
                &[
                    Value::from(config.user.as_str()),
                    Value::from(config.password.as_str()),
                ],
            )
            .await
            .map_err(|e| rpc_error(hostname, operation, e))?;

        let session = unwrap_envelope(hostname, operation, response)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CxmError::Hypervisor {
                node: hostname.to_string(),
                operation: operation.to_string(),
                details: "session reference is not a string".to_string(),
            })?;

        Ok(Self {
            hostname: hostname.to_string(),
            transport,
            session,
        })
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> CxmResult<Value> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::from(self.session.as_str()));
        params.extend(args);

        debug!("[API] {} -> {}", self.hostname, method);
        let response = self
            .transport
            .call(method, &params)
            .await
            .map_err(|e| rpc_error(&self.hostname, method, e))?;
        unwrap_envelope(&self.hostname, method, response)
    }

    fn shape_error(&self, operation: &str, details: impl Into<String>) -> CxmError {
        CxmError::Hypervisor {
            node: self.hostname.clone(),
            operation: operation.to_string(),
            details: details.into(),
        }
    }
}

/// Extract `Value` from a `{Status, Value | ErrorDescription}` envelope
pub(crate) fn unwrap_envelope(node: &str, operation: &str, response: Value) -> CxmResult<Value> {
    let status = response.get("Status").and_then(Value::as_str);
    if status == Some("Success") {
        return Ok(response.get("Value").cloned().unwrap_or(Value::Nil));
    }

    let details = match response.get("ErrorDescription").and_then(Value::as_array) {
        Some(parts) => parts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        None => format!("unexpected response {}", response),
    };
    Err(CxmError::Hypervisor {
        node: node.to_string(),
        operation: operation.to_string(),
        details,
    })
}

pub(crate) fn parse_domain_record(reference: &str, record: &Value) -> Option<DomainRecord> {
    Some(DomainRecord {
        reference: reference.to_string(),
        name_label: record.get("name_label")?.as_str()?.to_string(),
        domid: record.get("domid").and_then(Value::as_i64).unwrap_or(-1),
        power_state: record
            .get("power_state")
            .and_then(Value::as_str)
            .map(PowerState::parse)
            .unwrap_or(PowerState::Unknown),
        metrics: record
            .get("metrics")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

pub(crate) fn parse_metrics(record: &Value) -> VmMetrics {
    VmMetrics {
        memory_actual: record
            .get("memory_actual")
            .and_then(Value::as_i64)
            .and_then(|m| u64::try_from(m).ok())
            .unwrap_or(0),
        vcpus_number: record
            .get("VCPUs_number")
            .and_then(Value::as_i64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
    }
}

#[async_trait]
impl HypervisorSession for XenApiSession {
    async fn vm_by_name(&self, name: &str) -> CxmResult<Option<String>> {
        let refs = self.invoke("VM.get_by_name_label", vec![Value::from(name)]).await?;
        debug!("[API] {} vm={}", self.hostname, refs);
        Ok(refs
            .as_array()
            .and_then(|refs| refs.first())
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn power_state(&self, vm: &str) -> CxmResult<PowerState> {
        let method = "VM.get_power_state";
        let state = self.invoke(method, vec![Value::from(vm)]).await?;
        state
            .as_str()
            .map(PowerState::parse)
            .ok_or_else(|| self.shape_error(method, format!("unexpected power state {}", state)))
    }

    async fn vm_record(&self, vm: &str) -> CxmResult<DomainRecord> {
        let method = "VM.get_record";
        let record = self.invoke(method, vec![Value::from(vm)]).await?;
        parse_domain_record(vm, &record)
            .ok_or_else(|| self.shape_error(method, "record without name_label"))
    }

    async fn vm_metrics(&self, metrics: &str) -> CxmResult<VmMetrics> {
        let record = self
            .invoke("VM_metrics.get_record", vec![Value::from(metrics)])
            .await?;
        Ok(parse_metrics(&record))
    }

    async fn all_vm_records(&self) -> CxmResult<Vec<DomainRecord>> {
        let method = "VM.get_all_records";
        let records = self.invoke(method, Vec::new()).await?;
        debug!("[API] {} dom_recs={}", self.hostname, records);

        let records = records
            .as_struct()
            .ok_or_else(|| self.shape_error(method, "records are not a struct"))?;
        Ok(records
            .iter()
            .filter_map(|(reference, record)| parse_domain_record(reference, record))
            .collect())
    }

    async fn all_vm_metrics(&self) -> CxmResult<HashMap<String, VmMetrics>> {
        let method = "VM_metrics.get_all_records";
        let records = self.invoke(method, Vec::new()).await?;
        debug!("[API] {} dom_metrics_recs={}", self.hostname, records);

        let records = records
            .as_struct()
            .ok_or_else(|| self.shape_error(method, "records are not a struct"))?;
        Ok(records
            .iter()
            .map(|(reference, record)| (reference.clone(), parse_metrics(record)))
            .collect())
    }

    async fn clean_shutdown(&self, vm: &str) -> CxmResult<()> {
        self.invoke("VM.clean_shutdown", vec![Value::from(vm)]).await?;
        Ok(())
    }

    async fn hard_shutdown(&self, vm: &str) -> CxmResult<()> {
        self.invoke("VM.hard_shutdown", vec![Value::from(vm)]).await?;
        Ok(())
    }

    async fn migrate(&self, vm: &str, destination: &str) -> CxmResult<()> {
        let options = Value::structure([
            ("port", Value::from(0)),
            ("node", Value::from(-1)),
            ("ssl", Value::Nil),
        ]);
        self.invoke(
            "VM.migrate",
            vec![Value::from(vm), Value::from(destination), Value::from(true), options],
        )
        .await?;
        Ok(())
    }

    async fn logout(&self) -> CxmResult<()> {
        self.invoke("session.logout", Vec::new()).await?;
        Ok(())
    }
}
