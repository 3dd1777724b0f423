//! NATS broker binding.
//!
//! Maps the envelope onto core NATS: the header travels in the native
//! header facility (`type`, `content_type`, and `extensions` mirrored as a
//! JSON string), the reply address in the native reply subject, and the
//! body as the payload. Queue groups and `_INBOX.*` reply subjects are the
//! broker's own.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Channel, DynSubscription, RawHandler, Subscription};
use crate::address::Address;
use crate::error::{Error, Result};
use crate::message::{Extensions, MessageHeader, RawMessage, JSON_CONTENT_TYPE};

const TYPE_HEADER: &str = "type";
const CONTENT_TYPE_HEADER: &str = "content_type";
const EXTENSIONS_HEADER: &str = "extensions";

/// A [`Channel`] backed by a NATS cluster.
pub struct NatsChannel {
    servers: String,
    client: RwLock<Option<async_nats::Client>>,
}

impl NatsChannel {
    /// Create a channel for the given server URLs (comma-separated, e.g.
    /// `nats://localhost:4222`). Connection happens in [`Channel::connect`].
    pub fn new(servers: impl Into<String>) -> Self {
        Self {
            servers: servers.into(),
            client: RwLock::new(None),
        }
    }

    async fn client(&self) -> Result<async_nats::Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Channel("not connected".to_string()))
    }
}

#[async_trait]
impl Channel for NatsChannel {
    async fn connect(&self) -> Result<()> {
        let client = async_nats::connect(self.servers.as_str())
            .await
            .map_err(|err| Error::Channel(err.to_string()))?;
        info!(servers = %self.servers, "connected to NATS");
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.write().await.take() {
            client
                .flush()
                .await
                .map_err(|err| Error::Channel(err.to_string()))?;
        }
        Ok(())
    }

    async fn send(&self, topic: &str, raw: RawMessage) -> Result<()> {
        let client = self.client().await?;
        let headers = encode_headers(&raw.header)?;
        let payload = Bytes::from(raw.content);

        match raw.reply {
            Some(reply) => client
                .publish_with_reply_and_headers(
                    topic.to_string(),
                    reply.topic(),
                    headers,
                    payload,
                )
                .await
                .map_err(|err| Error::Channel(err.to_string())),
            None => client
                .publish_with_headers(topic.to_string(), headers, payload)
                .await
                .map_err(|err| Error::Channel(err.to_string())),
        }
    }

    async fn subscribe(
        &self,
        addr: Address,
        handler: RawHandler,
        queue: &str,
    ) -> Result<DynSubscription> {
        let client = self.client().await?;
        let topic = addr.topic();

        let subscriber = if queue.is_empty() {
            client.subscribe(topic.clone()).await
        } else {
            client.queue_subscribe(topic.clone(), queue.to_string()).await
        }
        .map_err(|err| Error::Channel(err.to_string()))?;

        debug!(topic = %topic, queue = %queue, "subscribed");

        let task = tokio::spawn(async move {
            let mut subscriber = subscriber;
            while let Some(msg) = subscriber.next().await {
                match decode_message(msg) {
                    Ok(raw) => handler(raw).await,
                    Err(err) => warn!(topic = %topic, %err, "dropping undecodable message"),
                }
            }
        });

        Ok(Arc::new(NatsSubscription {
            abort: task.abort_handle(),
        }))
    }

    async fn new_reply_topic(&self) -> Result<String> {
        Ok(self.client().await?.new_inbox())
    }
}

/// Dropping the forwarding task drops the subscriber, which unsubscribes
/// client-side.
struct NatsSubscription {
    abort: tokio::task::AbortHandle,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(&self) -> Result<()> {
        self.abort.abort();
        Ok(())
    }
}

fn encode_headers(header: &MessageHeader) -> Result<async_nats::HeaderMap> {
    let mut headers = async_nats::HeaderMap::new();
    headers.insert(TYPE_HEADER, header.r#type.as_str());
    headers.insert(CONTENT_TYPE_HEADER, header.content_type.as_str());
    if !header.extensions.is_empty() {
        let extensions = serde_json::to_string(&header.extensions)?;
        headers.insert(EXTENSIONS_HEADER, extensions.as_str());
    }
    Ok(headers)
}

fn decode_headers(headers: &async_nats::HeaderMap) -> Result<MessageHeader> {
    let r#type = headers
        .get(TYPE_HEADER)
        .map(|v| v.as_str().to_string())
        .ok_or_else(|| Error::MessageDecode("missing 'type' header".to_string()))?;
    let content_type = headers
        .get(CONTENT_TYPE_HEADER)
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|| JSON_CONTENT_TYPE.to_string());
    let extensions: Extensions = match headers.get(EXTENSIONS_HEADER) {
        Some(value) => serde_json::from_str(value.as_str())
            .map_err(|err| Error::MessageDecode(format!("bad extensions header: {err}")))?,
        None => Extensions::new(),
    };
    Ok(MessageHeader {
        r#type,
        content_type,
        extensions,
    })
}

fn decode_message(msg: async_nats::Message) -> Result<RawMessage> {
    let headers = msg.headers.unwrap_or_default();
    let header = decode_headers(&headers)?;
    let reply = msg
        .reply
        .map(|subject| Address::from_topic(subject.as_str()))
        .transpose()?;
    Ok(RawMessage {
        header,
        reply,
        content: msg.payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut extensions = Extensions::new();
        extensions.insert("model".into(), serde_json::json!("fast-1"));
        let header = MessageHeader {
            r#type: "Ping".into(),
            content_type: JSON_CONTENT_TYPE.into(),
            extensions,
        };

        let encoded = encode_headers(&header).unwrap();
        let decoded = decode_headers(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn missing_type_header_is_rejected() {
        let headers = async_nats::HeaderMap::new();
        assert!(decode_headers(&headers).is_err());
    }

    #[test]
    fn content_type_defaults_to_json() {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(TYPE_HEADER, "Ping");
        let header = decode_headers(&headers).unwrap();
        assert_eq!(header.content_type, JSON_CONTENT_TYPE);
        assert!(header.extensions.is_empty());
    }
}
