//! Client for the HTTP bridge.
//!
//! Speaks the bridge's JSON shapes: `POST /publish` for a single request
//! and `POST /publish_multi` as an SSE stream with a terminal `error`
//! event for remote failures.

use anyhow::{bail, Context};
use futures::StreamExt;

use coagent::{Address, Error, ErrorMessage, RawMessage};

pub struct BridgeClient {
    base: String,
    auth: String,
    client: reqwest::Client,
}

impl BridgeClient {
    pub fn new(base: impl Into<String>, auth: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            auth: auth.into(),
            client: reqwest::Client::new(),
        }
    }

    fn post(&self, path: &str, body: serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(format!("{}{path}", self.base)).json(&body);
        if !self.auth.is_empty() {
            req = req.bearer_auth(&self.auth);
        }
        req
    }

    pub async fn publish(
        &self,
        addr: &Address,
        msg: &RawMessage,
        timeout_secs: f64,
    ) -> anyhow::Result<RawMessage> {
        let body = serde_json::json!({
            "addr": addr,
            "msg": msg,
            "request": true,
            "timeout": timeout_secs,
        });
        let resp = self
            .post("/publish", body)
            .send()
            .await
            .context("failed to reach the bridge")?;

        if !resp.status().is_success() {
            let err: ErrorMessage = resp.json().await.context("unreadable error body")?;
            bail!(Error::from(err));
        }
        let raw: RawMessage = resp.json().await.context("unreadable reply body")?;
        Ok(raw)
    }

    /// Stream a multi-reply request, invoking `on_msg` for each envelope.
    pub async fn publish_multi(
        &self,
        addr: &Address,
        msg: &RawMessage,
        mut on_msg: impl FnMut(RawMessage),
    ) -> anyhow::Result<()> {
        let body = serde_json::json!({ "addr": addr, "msg": msg });
        let resp = self
            .post("/publish_multi", body)
            .send()
            .await
            .context("failed to reach the bridge")?;
        if !resp.status().is_success() {
            let err: ErrorMessage = resp.json().await.context("unreadable error body")?;
            bail!(Error::from(err));
        }

        let mut body = resp.bytes_stream();
        let mut parser = SseParser::default();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("stream interrupted")?;
            for event in parser.push(&chunk) {
                match event.name.as_deref() {
                    Some("error") => {
                        let err: ErrorMessage = serde_json::from_str(&event.data)
                            .context("unreadable error event")?;
                        bail!(Error::from(err));
                    }
                    _ => {
                        if event.data.is_empty() {
                            continue;
                        }
                        on_msg(RawMessage::decode_json(&event.data)?);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Minimal SSE parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub struct SseEvent {
    pub name: Option<String>,
    pub data: String,
}

/// Incremental parser for the subset of SSE the bridge emits: `event:` and
/// `data:` lines, events separated by blank lines.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    name: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if self.name.is_some() || !self.data.is_empty() {
                    events.push(SseEvent {
                        name: self.name.take(),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.name = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
            // Comment and id lines are ignored.
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_events() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].name, None);
        assert_eq!(events[1].data, "{\"b\":2}");
    }

    #[test]
    fn parses_named_events_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"event: err").is_empty());
        let events = parser.push(b"or\ndata: oops\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                name: Some("error".into()),
                data: "oops".into()
            }]
        );
    }

    #[test]
    fn ignores_comments() {
        let mut parser = SseParser::default();
        let events = parser.push(b": keep-alive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }
}
