// sms-protocol: Broker envelope types and routing names.
//
// Every broker payload is a JSON object with a top-level `type` field.  The
// gateway publishes device-originated SMS as `type = "message"` envelopes and
// consumes `message`, `command` and `request` payloads from its own queues.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Message type
// ---------------------------------------------------------------------------

/// The recognised values of the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Message,
    Command,
    Request,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::Command => "command",
            MessageType::Request => "request",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(MessageType::Message),
            "command" => Ok(MessageType::Command),
            "request" => Ok(MessageType::Request),
            other => Err(EnvelopeError::UnknownType(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope (gateway -> broker)
// ---------------------------------------------------------------------------

/// A complete logical SMS as published on `<name>.incoming`.
///
/// Timestamps are RFC 3339 strings.  `parts` is the number of concatenated
/// segments the text was reassembled from (1 for a single-part SMS).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub text: String,
    pub parts: u32,
    pub identity: String,
    pub received_timestamp: String,
    pub smsc_timestamp: String,
}

impl Envelope {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Json)
    }
}

// ---------------------------------------------------------------------------
// BrokerMessage (broker -> gateway)
// ---------------------------------------------------------------------------

/// A consumed broker payload whose `type` has been validated.
///
/// The body is kept as loose JSON: outbound and command payloads are produced
/// by arbitrary publishers and only the `type` field is contractual.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub kind: MessageType,
    pub body: serde_json::Value,
}

impl BrokerMessage {
    /// Parse and classify a raw broker payload.
    ///
    /// Fails for non-JSON payloads, non-object JSON, a missing `type` field,
    /// a non-string `type`, or an unrecognised type name.
    pub fn classify(payload: &[u8]) -> Result<Self, EnvelopeError> {
        let body: serde_json::Value = serde_json::from_slice(payload)?;
        let kind = match body.get("type") {
            None => return Err(EnvelopeError::MissingType),
            Some(serde_json::Value::String(s)) => s.parse::<MessageType>()?,
            Some(other) => return Err(EnvelopeError::UnknownType(other.to_string())),
        };
        Ok(BrokerMessage { kind, body })
    }

    /// Destination identity, when the publisher supplied one.
    pub fn identity(&self) -> Option<&str> {
        self.body.get("identity").and_then(serde_json::Value::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        self.body.get("text").and_then(serde_json::Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Topic exchange names.
pub mod exchanges {
    pub const MESSAGES: &str = "messages";
    pub const REQUESTS: &str = "requests";
    pub const COMMANDS: &str = "commands";

    pub const ALL: [&str; 3] = [MESSAGES, REQUESTS, COMMANDS];
}

/// Name-scoped routing keys (queue names equal their routing keys).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    pub incoming: String,
    pub outgoing: String,
    pub command: String,
    pub request: String,
}

impl Routes {
    pub fn for_name(name: &str) -> Self {
        Routes {
            incoming: format!("{}.incoming", name),
            outgoing: format!("{}.outgoing", name),
            command: format!("{}.command", name),
            request: format!("{}.request", name),
        }
    }

    /// `(exchange, queue)` pairs the gateway consumes from.
    pub fn consumed(&self) -> [(&'static str, &str); 3] {
        [
            (exchanges::MESSAGES, self.outgoing.as_str()),
            (exchanges::COMMANDS, self.command.as_str()),
            (exchanges::REQUESTS, self.request.as_str()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing type field")]
    MissingType,
    #[error("unrecognised type: {0}")]
    UnknownType(String),
}
