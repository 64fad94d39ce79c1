//! Message types flowing through the pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConfigId, MessageId};
use crate::{Error, Result};

/// A message as received from the network, before parsing.
///
/// Transient: lives only between the listener and the parser and is never
/// persisted.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Remote client address (IP, or "localhost" for unix sockets)
    pub client_addr: String,
    /// Local port the message arrived on
    pub local_port: u16,
    /// Unix socket path, when the listener is a unix socket
    pub socket_path: Option<String>,
    /// Undecoded frame bytes
    pub payload: Vec<u8>,
    /// Reception timestamp
    pub received_at: DateTime<Utc>,
}

/// A fully parsed syslog record. Immutable once produced by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    /// Syslog facility (0-23)
    pub facility: u8,
    /// Syslog severity (0-7)
    pub severity: u8,
    /// Priority value: facility * 8 + severity
    pub priority: u8,
    /// Reporting host
    pub hostname: String,
    /// Application name
    pub appname: String,
    /// Process identifier field
    pub procid: String,
    /// Message identifier field
    pub msgid: String,
    /// Timestamp claimed by the sender
    pub timestamp_reported: DateTime<Utc>,
    /// Timestamp assigned at reception
    pub timestamp_generated: DateTime<Utc>,
    /// Free-form message text
    pub message: String,
    /// RFC5424 structured data: section id -> (name -> value)
    #[serde(default)]
    pub structured_data: HashMap<String, HashMap<String, String>>,
    /// Additional parser- or source-specific properties
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

impl ParsedRecord {
    /// Serialise to the JSON payload produced to the broker.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }
}

/// Where a stored message came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageOrigin {
    /// Remote client address
    pub client: String,
    /// Local port the message arrived on
    pub local_port: u16,
    /// Unix socket path, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

/// The unit of persistence: a parsed record plus its identity and origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Primary key, unique for the process lifetime
    pub uid: MessageId,
    /// Source configuration that produced this message
    pub config_id: ConfigId,
    /// The parsed record
    pub parsed: ParsedRecord,
    /// Reception origin
    pub origin: MessageOrigin,
}

impl StoredMessage {
    /// Serialise for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Deserialise from storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }
}

/// Description of a listener opened by an ingest source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerInfo {
    /// Transport protocol ("tcp", "udp", "unix")
    pub protocol: String,
    /// Bind address
    pub bind_addr: String,
    /// Bound port (0 for unix sockets)
    pub port: u16,
}

impl std::fmt::Display for ListenerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.bind_addr, self.port)
    }
}
