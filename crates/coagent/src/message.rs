//! The wire envelope and typed messages.
//!
//! On the wire a message is a [`RawMessage`]: a header (type name, content
//! type, free-form extensions), an optional reply address, and opaque
//! content bytes. Typed messages implement [`Message`] and serialize their
//! fields to the JSON body; `reply` and `extensions` live on the envelope
//! only, never in the body. A body of `{}` is compacted to empty bytes and
//! decodes back to the default value.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{Error, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Free-form per-message metadata, propagated verbatim by the core.
pub type Extensions = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Message type name, used for handler dispatch.
    pub r#type: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    pub extensions: Extensions,
}

fn default_content_type() -> String {
    JSON_CONTENT_TYPE.to_string()
}

impl MessageHeader {
    pub fn new(r#type: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            content_type: default_content_type(),
            extensions: Extensions::new(),
        }
    }
}

/// The envelope used on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub header: MessageHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Address>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "content_serde")]
    pub content: Vec<u8>,
}

impl RawMessage {
    pub fn new(header: MessageHeader, content: Vec<u8>) -> Self {
        Self {
            header,
            reply: None,
            content,
        }
    }

    pub fn with_reply(mut self, reply: Address) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.header.extensions = extensions;
        self
    }

    /// Whether the envelope carries a message of type `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.header.r#type == M::NAME
    }

    pub fn encode_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn decode_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(Into::into)
    }
}

// The content is JSON text in practice; mirror it into JSON documents as a
// string rather than a byte array.
mod content_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text = std::str::from_utf8(content).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(text.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Typed messages
// ---------------------------------------------------------------------------

/// A schema-bearing message with a fixed wire type name.
///
/// Implementors derive `Serialize`, `Deserialize` and `JsonSchema` and pick
/// a `NAME`; encoding and decoding come for free.
pub trait Message:
    Serialize + DeserializeOwned + JsonSchema + Send + Sync + Sized + 'static
{
    /// The symbolic type name carried in the envelope header.
    const NAME: &'static str;

    fn encode(&self) -> Result<RawMessage> {
        let content = serde_json::to_vec(self)?;
        let content = if content == b"{}" { Vec::new() } else { content };
        Ok(RawMessage::new(MessageHeader::new(Self::NAME), content))
    }

    fn decode(raw: &RawMessage) -> Result<Self> {
        if raw.header.r#type != Self::NAME {
            return Err(Error::MessageDecode(format!(
                "expected message type '{}', got '{}'",
                Self::NAME,
                raw.header.r#type
            )));
        }
        if raw.header.content_type != JSON_CONTENT_TYPE {
            return Err(Error::MessageDecode(format!(
                "unsupported content type '{}'",
                raw.header.content_type
            )));
        }
        let content: &[u8] = if raw.content.is_empty() {
            b"{}"
        } else {
            &raw.content
        };
        serde_json::from_slice(content).map_err(|err| Error::MessageDecode(err.to_string()))
    }

    /// JSON schema of the message body, for discovery introspection.
    fn schema() -> serde_json::Value {
        let schema = schemars::SchemaGenerator::default().into_root_schema_for::<Self>();
        serde_json::to_value(schema).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Delivered to an agent by its own runtime right after it subscribed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Started {}

impl Message for Started {
    const NAME: &'static str = "Started";
}

/// Delivered to an agent by its own runtime just before it unsubscribes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Stopped {}

impl Message for Stopped {
    const NAME: &'static str = "Stopped";
}

/// A liveness/creation trigger with no handler-visible effect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProbeAgent {}

impl Message for ProbeAgent {
    const NAME: &'static str = "ProbeAgent";
}

/// Installs a default reply address on the receiving agent; used by
/// orchestrators to chain agent outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SetReplyAgent {
    pub address: Address,
}

impl Message for SetReplyAgent {
    const NAME: &'static str = "SetReplyAgent";
}

/// Placeholder reply when a handler produced nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Empty {}

impl Message for Empty {
    const NAME: &'static str = "Empty";
}

/// In-band terminator of a streaming reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StopIteration {}

impl Message for StopIteration {
    const NAME: &'static str = "StopIteration";
}

/// Requests cancellation of the currently running handler on the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Cancel {}

impl Message for Cancel {
    const NAME: &'static str = "Cancel";
}

/// An error signal, transported in place of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

impl Message for ErrorMessage {
    const NAME: &'static str = "Error";
}

impl From<&Error> for ErrorMessage {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorMessage> for Error {
    fn from(msg: ErrorMessage) -> Self {
        Error::from_wire(&msg.code, &msg.message)
    }
}

impl Error {
    /// Encode this error as its wire envelope.
    pub fn to_raw(&self) -> RawMessage {
        let msg = ErrorMessage::from(self);
        // An Error message body always serializes: two plain strings.
        msg.encode().unwrap_or_else(|_| {
            RawMessage::new(MessageHeader::new(ErrorMessage::NAME), Vec::new())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
    struct Ping {
        #[serde(default)]
        text: String,
    }

    impl Message for Ping {
        const NAME: &'static str = "Ping";
    }

    #[test]
    fn envelope_round_trip() {
        let ping = Ping {
            text: "hello".into(),
        };
        let raw = ping.encode().unwrap();
        assert_eq!(raw.header.r#type, "Ping");
        assert_eq!(raw.header.content_type, JSON_CONTENT_TYPE);
        assert_eq!(Ping::decode(&raw).unwrap(), ping);
    }

    #[test]
    fn empty_body_compaction() {
        let raw = Ping::default().encode().unwrap();
        assert!(raw.content.is_empty());
        assert_eq!(Ping::decode(&raw).unwrap(), Ping::default());

        let raw = Started {}.encode().unwrap();
        assert!(raw.content.is_empty());
        assert!(Started::decode(&raw).is_ok());
    }

    #[test]
    fn type_mismatch_is_a_decode_error() {
        let raw = Started {}.encode().unwrap();
        let err = Ping::decode(&raw).unwrap_err();
        assert_eq!(err.code(), "decode_error");
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let mut raw = Ping::default().encode().unwrap();
        raw.content = b"{not json".to_vec();
        assert!(Ping::decode(&raw).is_err());
    }

    #[test]
    fn json_round_trip_keeps_reply_and_extensions() {
        let mut extensions = Extensions::new();
        extensions.insert("model".into(), serde_json::json!("fast-1"));

        let raw = Ping {
            text: "hi".into(),
        }
        .encode()
        .unwrap()
        .with_reply(Address::reply("_INBOX.r1"))
        .with_extensions(extensions);

        let text = raw.encode_json().unwrap();
        let back = RawMessage::decode_json(&text).unwrap();
        assert_eq!(back, raw);
        assert_eq!(back.reply.as_ref().unwrap().topic(), "_INBOX.r1");
        assert_eq!(back.header.extensions["model"], "fast-1");
    }

    #[test]
    fn error_message_round_trip() {
        let err = Error::Cancelled;
        let raw = err.to_raw();
        let decoded = ErrorMessage::decode(&raw).unwrap();
        assert_eq!(decoded.code, "cancelled");
        assert_eq!(Error::from(decoded).code(), "cancelled");
    }
}
