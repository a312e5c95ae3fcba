use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pattern::{ExchangeStatus, Pattern};
use crate::registry::ComponentId;
use crate::tx::TxToken;

/// A normalized message: free-form properties plus a JSON content payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
    #[serde(default)]
    pub content: Value,
    /// True when the message represents a fault rather than a normal payload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fault: bool,
}

impl Message {
    pub fn new(content: Value) -> Self {
        Message { content, ..Default::default() }
    }

    pub fn fault(content: Value) -> Self {
        Message { content, fault: true, ..Default::default() }
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// Why an exchange ended in error, carried on the packet so the far side can
/// report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    Aborted,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn timeout(message: impl Into<String>) -> Self {
        ErrorInfo { kind: ErrorKind::Timeout, message: message.into() }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        ErrorInfo { kind: ErrorKind::Aborted, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        ErrorInfo { kind: ErrorKind::Other, message: message.into() }
    }
}

/// The single state record shared by the two proxy handles of an exchange.
///
/// Everything here except the transaction token is serializable so that an
/// exchange can be marshalled across a transport flow and merged back with
/// [`ExchangePacket::copy_from`] on the way home.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePacket {
    pub exchange_id: String,
    pub pattern: Pattern,
    pub status: ExchangeStatus,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub in_message: Option<Message>,
    #[serde(rename = "out", default, skip_serializing_if = "Option::is_none")]
    pub out_message: Option<Message>,
    #[serde(rename = "fault", default, skip_serializing_if = "Option::is_none")]
    pub fault_message: Option<Message>,
    /// Per-exchange persistence override; falls back to the activation spec
    /// and then the bus default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<ComponentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<ComponentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Set while the exchange travels under send_sync, cleared by plain send.
    #[serde(default)]
    pub synchronous: bool,
    /// Latched when a blocked thread gives up on the exchange; an aborted
    /// packet reports Error regardless of the stored status.
    #[serde(default)]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Transactions never cross a marshalling boundary.
    #[serde(skip)]
    pub transaction: Option<TxToken>,
}

impl ExchangePacket {
    pub fn new(pattern: Pattern) -> Self {
        ExchangePacket {
            exchange_id: Uuid::new_v4().to_string(),
            pattern,
            status: ExchangeStatus::default(),
            properties: HashMap::new(),
            in_message: None,
            out_message: None,
            fault_message: None,
            persistent: None,
            source_id: None,
            destination_id: None,
            service: None,
            endpoint: None,
            interface: None,
            operation: None,
            synchronous: false,
            aborted: false,
            error: None,
            transaction: None,
        }
    }

    /// Status as observed by the peers: an aborted exchange reads as Error.
    pub fn effective_status(&self) -> ExchangeStatus {
        if self.aborted { ExchangeStatus::Error } else { self.status }
    }

    /// Merge fields from a round-tripped copy of this packet, keeping our own
    /// transaction token. Used when an exchange returns from a transport hop
    /// and must be folded back into the locally pending instance.
    pub fn copy_from(&mut self, other: &ExchangePacket) {
        let transaction = self.transaction;
        let mut merged = other.clone();
        merged.transaction = transaction;
        *self = merged;
    }
}
