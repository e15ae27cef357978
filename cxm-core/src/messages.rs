//! Heartbeat message protocol
//!
//! Nodes publish a slave heartbeat listing the VMs they run; the master
//! publishes the aggregated cluster status. On the wire every message is an
//! envelope `{"type": <tag>, "data": <payload>}` whose payload always carries
//! the cluster name:
//!
//! ```json
//! {"type": "slavehb", "data": {"cluster": "prod", "ts": 1300000000, "vms": ["web1"]}}
//! {"type": "masterhb", "data": {"cluster": "prod", "status": {"xen1": "up"}}}
//! ```
//!
//! Parsing has three outcomes. A message for another cluster is not an error:
//! it comes back as [`ParseOutcome::Discarded`] and callers drop it silently.

use crate::config::CxmConfig;
use crate::resolver::{HostResolver, SystemResolver};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const SLAVE_HEARTBEAT_TAG: &str = "slavehb";
pub const MASTER_HEARTBEAT_TAG: &str = "masterhb";

/// Malformed or unknown messages
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("{field} must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

/// Raw wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// Message variants, one per wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SlaveHeartbeat,
    MasterHeartbeat,
}

impl MessageKind {
    pub fn tag(&self) -> &'static str {
        match self {
            MessageKind::SlaveHeartbeat => SLAVE_HEARTBEAT_TAG,
            MessageKind::MasterHeartbeat => MASTER_HEARTBEAT_TAG,
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, MessageError> {
        match tag {
            SLAVE_HEARTBEAT_TAG => Ok(MessageKind::SlaveHeartbeat),
            MASTER_HEARTBEAT_TAG => Ok(MessageKind::MasterHeartbeat),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// VM inventory of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveHeartbeat {
    /// Emission time, seconds since the epoch
    pub ts: i64,
    /// Names of the VMs running on the emitting node
    pub vms: Vec<String>,
}

impl SlaveHeartbeat {
    pub fn forge(vms: Vec<String>) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp(),
            vms,
        }
    }

    fn parse(data: &Map<String, Value>) -> Result<Self, MessageError> {
        let ts = data
            .get("ts")
            .ok_or(MessageError::MissingField("ts"))?
            .as_i64()
            .ok_or(MessageError::InvalidField {
                field: "ts",
                expected: "an integer",
            })?;

        let vms = data
            .get("vms")
            .ok_or(MessageError::MissingField("vms"))?
            .as_array()
            .ok_or(MessageError::InvalidField {
                field: "vms",
                expected: "a list",
            })?
            .iter()
            .map(|vm| {
                vm.as_str().map(str::to_string).ok_or(MessageError::InvalidField {
                    field: "vms",
                    expected: "a list of names",
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { ts, vms })
    }

    fn fill(&self, data: &mut Map<String, Value>) {
        data.insert("ts".to_string(), json!(self.ts));
        data.insert("vms".to_string(), json!(self.vms));
    }
}

/// Aggregated cluster status, passed through untouched
#[derive(Debug, Clone, PartialEq)]
pub struct MasterHeartbeat {
    pub status: Map<String, Value>,
}

impl MasterHeartbeat {
    pub fn forge(status: Map<String, Value>) -> Self {
        Self { status }
    }

    fn parse(data: &Map<String, Value>) -> Result<Self, MessageError> {
        let status = data
            .get("status")
            .ok_or(MessageError::MissingField("status"))?
            .as_object()
            .ok_or(MessageError::InvalidField {
                field: "status",
                expected: "a mapping",
            })?
            .clone();

        Ok(Self { status })
    }

    fn fill(&self, data: &mut Map<String, Value>) {
        data.insert("status".to_string(), Value::Object(self.status.clone()));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    SlaveHeartbeat(SlaveHeartbeat),
    MasterHeartbeat(MasterHeartbeat),
}

/// A parsed or forged heartbeat
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Cluster the message belongs to
    pub cluster: String,
    /// Node the message comes from
    pub node: String,
    pub payload: Payload,
}

/// Result of parsing an envelope addressed to any cluster
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(Message),
    /// The message belongs to another cluster and must be ignored
    Discarded { cluster: String },
}

impl ParseOutcome {
    pub fn into_message(self) -> Option<Message> {
        match self {
            ParseOutcome::Parsed(message) => Some(message),
            ParseOutcome::Discarded { .. } => None,
        }
    }
}

/// Local knowledge needed to forge and filter messages
#[derive(Clone)]
pub struct MessageContext {
    cluster_name: String,
    resolver: Arc<dyn HostResolver>,
}

impl MessageContext {
    pub fn new(cluster_name: impl Into<String>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            resolver,
        }
    }

    pub fn from_config(config: &CxmConfig) -> Self {
        Self::new(config.cluster_name.clone(), Arc::new(SystemResolver))
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Node name for a transport host identifier, or the local node when absent
    pub fn origin(&self, host: Option<&str>) -> String {
        match host {
            Some(host) => self.resolver.name_of(host),
            None => self.resolver.local_name(),
        }
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("cluster_name", &self.cluster_name)
            .finish()
    }
}

impl Message {
    /// Heartbeat announcing the VMs running on this node
    pub fn forge_slave_heartbeat(ctx: &MessageContext, vms: Vec<String>) -> Self {
        Self::forge(ctx, Payload::SlaveHeartbeat(SlaveHeartbeat::forge(vms)))
    }

    /// Heartbeat carrying the aggregated cluster status
    pub fn forge_master_heartbeat(ctx: &MessageContext, status: Map<String, Value>) -> Self {
        Self::forge(ctx, Payload::MasterHeartbeat(MasterHeartbeat::forge(status)))
    }

    fn forge(ctx: &MessageContext, payload: Payload) -> Self {
        Self {
            cluster: ctx.cluster_name.clone(),
            node: ctx.origin(None),
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::SlaveHeartbeat(_) => MessageKind::SlaveHeartbeat,
            Payload::MasterHeartbeat(_) => MessageKind::MasterHeartbeat,
        }
    }

    /// Wire envelope of this message
    pub fn value(&self) -> Value {
        let mut data = Map::new();
        match &self.payload {
            Payload::SlaveHeartbeat(hb) => hb.fill(&mut data),
            Payload::MasterHeartbeat(hb) => hb.fill(&mut data),
        }
        data.insert("cluster".to_string(), Value::String(self.cluster.clone()));

        json!({ "type": self.kind().tag(), "data": data })
    }

    /// Parse the payload of a message of the given kind.
    ///
    /// The cluster tag is checked before any variant field, so a message for
    /// another cluster is discarded even when its payload is malformed.
    pub fn parse(
        ctx: &MessageContext,
        kind: MessageKind,
        origin: Option<&str>,
        data: &Value,
    ) -> Result<ParseOutcome, MessageError> {
        let node = ctx.origin(origin);

        let data = data.as_object().ok_or(MessageError::InvalidField {
            field: "data",
            expected: "a mapping",
        })?;

        let cluster = data
            .get("cluster")
            .ok_or(MessageError::MissingField("cluster"))?
            .as_str()
            .ok_or(MessageError::InvalidField {
                field: "cluster",
                expected: "a string",
            })?;

        if cluster != ctx.cluster_name {
            tracing::trace!(cluster, "Message from other cluster ignored");
            return Ok(ParseOutcome::Discarded {
                cluster: cluster.to_string(),
            });
        }

        let payload = match kind {
            MessageKind::SlaveHeartbeat => Payload::SlaveHeartbeat(SlaveHeartbeat::parse(data)?),
            MessageKind::MasterHeartbeat => Payload::MasterHeartbeat(MasterHeartbeat::parse(data)?),
        };

        Ok(ParseOutcome::Parsed(Message {
            cluster: cluster.to_string(),
            node,
            payload,
        }))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::SlaveHeartbeat(hb) => write!(f, "<MessageSlaveHB from {} : {}>", self.node, hb.ts),
            Payload::MasterHeartbeat(hb) => {
                write!(f, "<MessageMasterHB from {} : {}>", self.node, Value::Object(hb.status.clone()))
            }
        }
    }
}

/// Entry point for envelopes handed over by the transport
pub struct MessageHelper;

impl MessageHelper {
    /// Decode an envelope received from `origin` (or from this node when
    /// absent).
    pub fn get(
        ctx: &MessageContext,
        envelope: &Value,
        origin: Option<&str>,
    ) -> Result<ParseOutcome, MessageError> {
        let envelope: Envelope = serde_json::from_value(envelope.clone())
            .map_err(|e| MessageError::MalformedEnvelope(e.to_string()))?;
        Self::get_envelope(ctx, &envelope, origin)
    }

    pub fn get_envelope(
        ctx: &MessageContext,
        envelope: &Envelope,
        origin: Option<&str>,
    ) -> Result<ParseOutcome, MessageError> {
        let kind = MessageKind::from_tag(&envelope.kind)?;
        Message::parse(ctx, kind, origin, &envelope.data)
    }

    /// Declared type of an envelope, without parsing its payload
    pub fn kind(envelope: &Value) -> Result<MessageKind, MessageError> {
        let tag = envelope
            .get("type")
            .ok_or(MessageError::MissingField("type"))?
            .as_str()
            .ok_or(MessageError::InvalidField {
                field: "type",
                expected: "a string",
            })?;
        MessageKind::from_tag(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use pretty_assertions::assert_eq;

    fn ctx() -> MessageContext {
        MessageContext::new("prod", Arc::new(StaticResolver::new("xen1")))
    }

    fn parsed(outcome: ParseOutcome) -> Message {
        match outcome {
            ParseOutcome::Parsed(message) => message,
            other => panic!("expected a parsed message, got {:?}", other),
        }
    }

    #[test]
    fn test_slave_heartbeat_round_trip() {
        let ctx = ctx();
        let forged = Message::forge_slave_heartbeat(&ctx, vec!["web1".into(), "db1".into()]);

        let value = forged.value();
        assert_eq!(value["type"], "slavehb");
        assert_eq!(value["data"]["cluster"], "prod");
        assert_eq!(value["data"]["vms"], json!(["web1", "db1"]));

        let message = parsed(MessageHelper::get(&ctx, &value, None).unwrap());
        assert_eq!(message, forged);
        assert_eq!(message.node, "xen1");
    }

    #[test]
    fn test_master_heartbeat_round_trip() {
        let ctx = ctx();
        let mut status = Map::new();
        status.insert("xen1".into(), json!({"state": "online", "vms": 3}));
        status.insert("xen2".into(), json!(null));

        let forged = Message::forge_master_heartbeat(&ctx, status.clone());
        let message = parsed(MessageHelper::get(&ctx, &forged.value(), None).unwrap());

        assert_eq!(message, forged);
        match message.payload {
            Payload::MasterHeartbeat(hb) => assert_eq!(hb.status, status),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_origin_host_is_resolved() {
        let ctx = ctx();
        let value = json!({"type": "slavehb", "data": {"cluster": "prod", "ts": 12, "vms": []}});

        let message = parsed(MessageHelper::get(&ctx, &value, Some("xen2")).unwrap());
        assert_eq!(message.node, "xen2");
        assert_eq!(message.to_string(), "<MessageSlaveHB from xen2 : 12>");
    }

    #[test]
    fn test_other_cluster_is_discarded() {
        let ctx = ctx();
        let slave = json!({"type": "slavehb", "data": {"cluster": "lab", "ts": 1, "vms": ["a"]}});
        let master = json!({"type": "masterhb", "data": {"cluster": "lab", "status": {}}});

        for envelope in [slave, master] {
            assert_eq!(
                MessageHelper::get(&ctx, &envelope, Some("xen9")),
                Ok(ParseOutcome::Discarded {
                    cluster: "lab".to_string()
                })
            );
        }
    }

    #[test]
    fn test_other_cluster_wins_over_bad_payload() {
        let ctx = ctx();
        let value = json!({"type": "slavehb", "data": {"cluster": "lab", "vms": "oops"}});
        assert!(matches!(
            MessageHelper::get(&ctx, &value, None),
            Ok(ParseOutcome::Discarded { .. })
        ));
    }

    #[test]
    fn test_vms_must_be_a_list() {
        let ctx = ctx();
        let value = json!({"type": "slavehb", "data": {"cluster": "prod", "ts": 1, "vms": "web1"}});
        assert_eq!(
            MessageHelper::get(&ctx, &value, None),
            Err(MessageError::InvalidField {
                field: "vms",
                expected: "a list"
            })
        );
    }

    #[test]
    fn test_status_must_be_a_mapping() {
        let ctx = ctx();
        let value = json!({"type": "masterhb", "data": {"cluster": "prod", "status": ["xen1"]}});
        assert_eq!(
            MessageHelper::get(&ctx, &value, None),
            Err(MessageError::InvalidField {
                field: "status",
                expected: "a mapping"
            })
        );
    }

    #[test]
    fn test_unknown_type_and_missing_fields() {
        let ctx = ctx();

        let value = json!({"type": "nodestate", "data": {"cluster": "prod"}});
        assert_eq!(
            MessageHelper::get(&ctx, &value, None),
            Err(MessageError::UnknownType("nodestate".to_string()))
        );
        assert!(MessageHelper::kind(&value).is_err());

        let value = json!({"type": "slavehb", "data": {"cluster": "prod", "vms": []}});
        assert_eq!(
            MessageHelper::get(&ctx, &value, None),
            Err(MessageError::MissingField("ts"))
        );

        let value = json!({"data": {}});
        assert!(matches!(
            MessageHelper::get(&ctx, &value, None),
            Err(MessageError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_kind_lookup() {
        let value = json!({"type": "masterhb", "data": null});
        assert_eq!(MessageHelper::kind(&value), Ok(MessageKind::MasterHeartbeat));
        assert_eq!(MessageKind::from_tag("slavehb"), Ok(MessageKind::SlaveHeartbeat));
        assert_eq!(MessageKind::SlaveHeartbeat.to_string(), "slavehb");
    }
}
