//! Wire protocol for key-scoped document synchronization.
//!
//! Every frame on the socket is one [`CommandMessage`]:
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ zlib/deflate( JSON { command, agent, key?, data? } )     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Binary frames only. Text frames are ignored by both ends.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::ops::Operation;

/// Header every client must present on the upgrade request.
pub const HEADER_KEY: &str = "x-vulppi-client";
/// Expected value of [`HEADER_KEY`].
pub const HEADER_VALUE: &str = "vulppi-datasync-client";
/// WebSocket subprotocol requested by the client.
pub const SUBPROTOCOL: &str = "vulppi-datasync-client";
/// Namespace used when a short `collection:id` key is bound.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Upper bound on the inflated size of one frame.
pub const MAX_DECODED_SIZE: usize = 32 * 1024 * 1024;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("Message has no key")]
    MissingKey,
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

// ─── DataKey ─────────────────────────────────────────────────────────

/// Compound document identifier `namespace:collection:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataKey {
    namespace: String,
    collection: String,
    id: String,
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$'))
}

impl DataKey {
    /// Build a key from its three segments, validating each.
    pub fn new(
        namespace: impl Into<String>,
        collection: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let key = Self {
            namespace: namespace.into(),
            collection: collection.into(),
            id: id.into(),
        };
        for segment in [&key.namespace, &key.collection, &key.id] {
            if !valid_segment(segment) {
                return Err(ProtocolError::InvalidKey {
                    key: key.to_string(),
                    reason: "segments must match [a-z0-9_-$]+",
                });
            }
        }
        Ok(key)
    }

    /// Parse a full `namespace:collection:id` key.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let mut parts = raw.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(collection), Some(id), None) => Self::new(ns, collection, id),
            _ => Err(ProtocolError::InvalidKey {
                key: raw.to_string(),
                reason: "expected namespace:collection:id",
            }),
        }
    }

    /// Build a key from the short `collection:id` form.
    ///
    /// `namespace` falls back to [`DEFAULT_NAMESPACE`].
    pub fn namespaced(short: &str, namespace: Option<&str>) -> Result<Self, ProtocolError> {
        match short.split_once(':') {
            Some((collection, id)) if !id.contains(':') => {
                Self::new(namespace.unwrap_or(DEFAULT_NAMESPACE), collection, id)
            }
            _ => Err(ProtocolError::InvalidKey {
                key: short.to_string(),
                reason: "expected collection:id",
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.collection, self.id)
    }
}

impl FromStr for DataKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DataKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DataKey> for String {
    fn from(key: DataKey) -> Self {
        key.to_string()
    }
}

// ─── Command / Agent ─────────────────────────────────────────────────

/// Command verbs. Aliases (`bind`, `update`, `unbind`) are kept distinct
/// so a relay can echo exactly what it received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Get,
    Bind,
    Set,
    Update,
    Leave,
    Unbind,
    Init,
    Error,
    /// Anything else; ignored by both ends.
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Get => "get",
            Command::Bind => "bind",
            Command::Set => "set",
            Command::Update => "update",
            Command::Leave => "leave",
            Command::Unbind => "unbind",
            Command::Init => "init",
            Command::Error => "error",
            Command::Other(other) => other,
        }
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        match value.as_str() {
            "get" => Command::Get,
            "bind" => Command::Bind,
            "set" => Command::Set,
            "update" => Command::Update,
            "leave" => Command::Leave,
            "unbind" => Command::Unbind,
            "init" => Command::Init,
            "error" => Command::Error,
            _ => Command::Other(value),
        }
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.as_str().to_string()
    }
}

/// Which side produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Server,
    Client,
    Anonymous,
}

// ─── UserContext ─────────────────────────────────────────────────────

/// Server-assigned identity attached to every provider call made on behalf
/// of a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl UserContext {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }

    /// Context with a freshly generated id.
    pub fn anonymous() -> Self {
        Self::with_id(generate_id())
    }

    /// Attach an arbitrary claim.
    pub fn claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    /// Fill in a generated id when the validation hook returned none.
    pub fn ensure_id(mut self) -> Self {
        if self.id.is_empty() {
            self.id = generate_id();
        }
        self
    }
}

/// Random lowercase alphanumeric identifier.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ─── CommandMessage ──────────────────────────────────────────────────

/// Payload of a client-submitted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpsPayload {
    pub ops: Vec<Operation>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: Command,
    pub agent: Agent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<DataKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandMessage {
    /// Client subscription + snapshot request.
    pub fn get(key: DataKey) -> Self {
        Self {
            command: Command::Get,
            agent: Agent::Client,
            key: Some(key),
            data: None,
        }
    }

    /// Client mutation carrying `{ ops }`.
    pub fn set_ops(key: DataKey, ops: &[Operation]) -> Self {
        let data = serde_json::to_value(OpsPayload { ops: ops.to_vec() }).ok();
        Self {
            command: Command::Set,
            agent: Agent::Client,
            key: Some(key),
            data,
        }
    }

    /// Client unsubscription.
    pub fn unbind(key: DataKey) -> Self {
        Self {
            command: Command::Unbind,
            agent: Agent::Client,
            key: Some(key),
            data: None,
        }
    }

    /// Server push of the current document.
    pub fn document(key: DataKey, document: Value) -> Self {
        Self {
            command: Command::Set,
            agent: Agent::Server,
            key: Some(key),
            data: Some(document),
        }
    }

    /// Server greeting carrying the session context.
    pub fn init(context: &UserContext) -> Self {
        Self {
            command: Command::Init,
            agent: Agent::Server,
            key: None,
            data: serde_json::to_value(context).ok(),
        }
    }

    /// Mutation rejected; sent to the originating client only.
    pub fn error(key: DataKey, reason: impl Into<String>) -> Self {
        Self {
            command: Command::Error,
            agent: Agent::Server,
            key: Some(key),
            data: Some(Value::String(reason.into())),
        }
    }

    /// Operations carried by a client `set`/`update`.
    pub fn ops(&self) -> Result<Vec<Operation>, ProtocolError> {
        match &self.data {
            None => Ok(Vec::new()),
            Some(data) => serde_json::from_value::<OpsPayload>(data.clone())
                .map(|payload| payload.ops)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
        }
    }

    /// Session context carried by `init`.
    pub fn context(&self) -> Result<UserContext, ProtocolError> {
        let data = self.data.clone().unwrap_or(Value::Object(Map::new()));
        serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Error reason carried by `error`.
    pub fn reason(&self) -> String {
        match &self.data {
            Some(Value::String(reason)) => reason.clone(),
            Some(other) => other.to_string(),
            None => String::from("unknown error"),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let json =
            serde_json::to_vec(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
        encoder
            .write_all(&json)
            .and_then(|_| encoder.finish())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut json = Vec::with_capacity(bytes.len() * 2);
        ZlibDecoder::new(bytes)
            .take(MAX_DECODED_SIZE as u64 + 1)
            .read_to_end(&mut json)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if json.len() > MAX_DECODED_SIZE {
            return Err(ProtocolError::DeserializationError(format!(
                "frame inflates past {MAX_DECODED_SIZE} bytes"
            )));
        }
        serde_json::from_slice(&json).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::PathSegment;
    use serde_json::json;

    fn key() -> DataKey {
        DataKey::parse("default:doc:1").unwrap()
    }

    #[test]
    fn test_data_key_parse() {
        let key = DataKey::parse("Default:user_list:A-1$").unwrap();
        assert_eq!(key.namespace(), "Default");
        assert_eq!(key.collection(), "user_list");
        assert_eq!(key.id(), "A-1$");
        assert_eq!(key.to_string(), "Default:user_list:A-1$");
    }

    #[test]
    fn test_data_key_rejects_malformed() {
        assert!(DataKey::parse("doc:1").is_err());
        assert!(DataKey::parse("a:b:c:d").is_err());
        assert!(DataKey::parse("a::c").is_err());
        assert!(DataKey::parse("a:b c:d").is_err());
        assert!(DataKey::parse("a:b:d/e").is_err());
    }

    #[test]
    fn test_data_key_namespaced() {
        let key = DataKey::namespaced("user:1", None).unwrap();
        assert_eq!(key.to_string(), "default:user:1");

        let key = DataKey::namespaced("user:1", Some("tenant")).unwrap();
        assert_eq!(key.to_string(), "tenant:user:1");

        assert!(DataKey::namespaced("user", None).is_err());
        assert!(DataKey::namespaced("a:b:c", None).is_err());
    }

    #[test]
    fn test_command_aliases_roundtrip_as_strings() {
        for name in ["get", "bind", "set", "update", "leave", "unbind", "init", "error"] {
            let command = Command::from(name.to_string());
            assert_eq!(command.as_str(), name);
        }
        assert_eq!(
            Command::from("ping".to_string()),
            Command::Other("ping".to_string())
        );
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = CommandMessage::document(key(), json!({"count": 1}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"command": "set", "agent": "server", "key": "default:doc:1", "data": {"count": 1}})
        );
    }

    #[test]
    fn test_encode_decode() {
        let ops = vec![Operation::Set {
            path: vec![PathSegment::Key("count".into())],
            before: None,
            after: json!(1),
        }];
        let msg = CommandMessage::set_ops(key(), &ops);
        let decoded = CommandMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.ops().unwrap(), ops);
    }

    #[test]
    fn test_init_carries_context() {
        let ctx = UserContext::with_id("u1").claim("name", "Alice");
        let msg = CommandMessage::init(&ctx);
        assert!(msg.key.is_none());
        let decoded = CommandMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.command, Command::Init);
        assert_eq!(decoded.context().unwrap(), ctx);
    }

    #[test]
    fn test_error_reason() {
        let msg = CommandMessage::error(key(), "lock timeout");
        assert_eq!(msg.reason(), "lock timeout");
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(CommandMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_decode_rejects_malformed_key() {
        let raw = serde_json::to_vec(&json!({"command": "get", "agent": "client", "key": "bad"})).unwrap();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let bytes = encoder.finish().unwrap();
        assert!(CommandMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_caps_inflated_size() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&vec![b' '; MAX_DECODED_SIZE + 1]).unwrap();
        let bytes = encoder.finish().unwrap();
        assert!(bytes.len() < 1024 * 1024);
        match CommandMessage::decode(&bytes) {
            Err(ProtocolError::DeserializationError(reason)) => assert!(reason.contains("inflates past")),
            other => panic!("expected size error, got {other:?}"),
        }
    }

    #[test]
    fn test_context_ensure_id() {
        let ctx = UserContext::default().ensure_id();
        assert_eq!(ctx.id.len(), 32);
        let ctx = UserContext::with_id("fixed").ensure_id();
        assert_eq!(ctx.id, "fixed");
    }

    #[test]
    fn test_missing_ops_payload_is_empty() {
        let msg = CommandMessage {
            command: Command::Update,
            agent: Agent::Client,
            key: Some(key()),
            data: None,
        };
        assert!(msg.ops().unwrap().is_empty());
    }
}
