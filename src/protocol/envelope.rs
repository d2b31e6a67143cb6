//! Management envelope carried on reserved topics
//!
//! Every envelope is either a request (no `ack`) or a response (`ack` echoes
//! the originating `id`). Routing depends only on that distinction because
//! both directions share the same reserved topics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation token matching a response to its request
pub type CorrelationId = u64;

/// Management message type
///
/// Unrecognised type strings are kept as [`MessageType::Unknown`] so the
/// dispatcher can answer them with an error status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Regist,
    Deregist,
    Status,
    LoadConfig,
    Control,
    Config,
    Will,
    Response,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Regist => "REGIST",
            MessageType::Deregist => "DEREGIST",
            MessageType::Status => "STATUS",
            MessageType::LoadConfig => "LOADCONFIG",
            MessageType::Control => "CONTROL",
            MessageType::Config => "CONFIG",
            MessageType::Will => "WILL",
            MessageType::Response => "RESPONSE",
            MessageType::Unknown(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "REGIST" => MessageType::Regist,
            "DEREGIST" => MessageType::Deregist,
            "STATUS" => MessageType::Status,
            // Older services still send the short spelling
            "LOADCONFIG" | "LoadConf" => MessageType::LoadConfig,
            "CONTROL" => MessageType::Control,
            "CONFIG" => MessageType::Config,
            "WILL" => MessageType::Will,
            "RESPONSE" => MessageType::Response,
            _ => MessageType::Unknown(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome carried by a response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Error")]
    Error,
}

/// Request or response, decided by the presence of `ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
}

/// Wire unit for management traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Identity of the sending device or service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Present on requests that expect a reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    /// Topic the responder must publish its response to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,
    /// Present on responses, echoes the originating `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error text on `Error` responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    /// Bare request of the given type sent by `from`
    pub fn request(message_type: MessageType, from: &str) -> Self {
        Self {
            message_type,
            from: Some(from.to_string()),
            id: None,
            replyto: None,
            ack: None,
            status: None,
            data: None,
            message: None,
        }
    }

    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_reply_to(mut self, topic: impl Into<String>) -> Self {
        self.replyto = Some(topic.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Successful response to the request identified by `ack`
    pub fn response_ok(from: &str, ack: CorrelationId, data: Value) -> Self {
        Self {
            message_type: MessageType::Response,
            from: Some(from.to_string()),
            id: None,
            replyto: None,
            ack: Some(ack),
            status: Some(ResponseStatus::Ok),
            data: Some(data),
            message: None,
        }
    }

    /// Error response to the request identified by `ack`
    pub fn response_error(from: &str, ack: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Response,
            from: Some(from.to_string()),
            id: None,
            replyto: None,
            ack: Some(ack),
            status: Some(ResponseStatus::Error),
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        if self.ack.is_some() {
            EnvelopeKind::Response
        } else {
            EnvelopeKind::Request
        }
    }

    /// Interpret a response envelope as the outcome of a transaction
    ///
    /// Anything other than an explicit `OK` status counts as a failure.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.status {
            Some(ResponseStatus::Ok) => Ok(self.data.unwrap_or(Value::Null)),
            _ => Err(self
                .message
                .unwrap_or_else(|| "remote peer reported an error".to_string())),
        }
    }

    /// Parse an envelope from a raw MQTT payload
    pub fn parse(payload: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(payload).map_err(|e| format!("Failed to parse envelope: {e}"))
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Payload of a CONTROL request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlData {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Payload of a CONFIG request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// Payload of a STATUS report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub name: String,
    pub value: Value,
}

/// Metadata announced in a REGIST envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    pub capabilities: Vec<String>,
}
