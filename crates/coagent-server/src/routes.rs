//! The HTTP bridge routes.
//!
//! A stateless façade over a [`coagent::Runtime`]: publish (one-shot or
//! request), streaming publish and address subscriptions as SSE, fresh
//! reply topics, and an aggregated discovery query. A client disconnect
//! mid-operation publishes `Cancel` to the target agent.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use coagent::{
    Address, Cancel, Channel, DiscoveryQuery, DiscoveryReply, DynSubscription, Error,
    ErrorMessage, Message, PublishOptions, RawHandler, RawMessage, DEFAULT_REQUEST_TIMEOUT,
};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/publish", post(publish))
        .route("/publish_multi", post(publish_multi))
        .route("/subscribe", post(subscribe))
        .route("/reply-topics", post(reply_topics))
        .route("/discovery", get(discovery))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PublishRequest {
    addr: Address,
    msg: RawMessage,
    #[serde(default)]
    request: bool,
    #[serde(default)]
    reply: String,
    /// Request timeout in seconds.
    timeout: Option<f64>,
    probe: Option<bool>,
}

impl PublishRequest {
    fn options(&self) -> PublishOptions {
        let mut opts = PublishOptions::default().probe(self.probe.unwrap_or(true));
        opts.request = self.request;
        opts.reply = self.reply.clone();
        opts.timeout = self
            .timeout
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        opts
    }
}

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    addr: Address,
}

#[derive(Debug, Deserialize)]
struct DiscoveryParams {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    inclusive: bool,
    #[serde(default)]
    detailed: bool,
}

fn error_response(err: &Error) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorMessage::from(err))).into_response()
}

// ---------------------------------------------------------------------------
// Cancel-on-disconnect guard
// ---------------------------------------------------------------------------

/// Publishes `Cancel` to the target when dropped before being disarmed.
/// Handler futures and SSE streams are dropped on client disconnect, which
/// is exactly when the in-flight operation should be cancelled.
struct CancelOnDrop {
    channel: Arc<dyn Channel>,
    addr: Address,
    armed: bool,
}

impl CancelOnDrop {
    fn new(channel: Arc<dyn Channel>, addr: Address) -> Self {
        Self {
            channel,
            addr,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(agent = %self.addr, "client disconnected; cancelling");
        let channel = self.channel.clone();
        let addr = self.addr.clone();
        tokio::spawn(async move {
            if let Ok(msg) = (Cancel {}).encode() {
                let _ = channel
                    .publish(addr, msg, PublishOptions::default().probe(false))
                    .await;
            }
        });
    }
}

/// Releases an address subscription when the SSE stream goes away.
struct UnsubscribeOnDrop(Option<DynSubscription>);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        if let Some(sub) = self.0.take() {
            tokio::spawn(async move {
                let _ = sub.unsubscribe().await;
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn publish(State(state): State<AppState>, Json(req): Json<PublishRequest>) -> Response {
    let channel = state.runtime.channel();
    let opts = req.options();
    let mut guard = CancelOnDrop::new(channel.clone(), req.addr.clone());

    let result = channel.publish(req.addr.clone(), req.msg.clone(), opts).await;
    guard.disarm();

    match result {
        Ok(Some(raw)) => Json(raw).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn publish_multi(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Response {
    let channel = state.runtime.channel();
    let probe = req.probe.unwrap_or(true);

    let stream = match channel
        .publish_multi(req.addr.clone(), req.msg.clone(), probe)
        .await
    {
        Ok(stream) => stream,
        Err(err) => return error_response(&err),
    };

    let mut guard = CancelOnDrop::new(channel, req.addr);
    let events = async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => {
                    let data = raw.encode_json().unwrap_or_default();
                    yield Ok::<Event, Infallible>(Event::default().data(data));
                }
                Err(err) => {
                    // A remote error ends the stream; nothing left to cancel.
                    guard.disarm();
                    let body = serde_json::to_string(&ErrorMessage::from(&err))
                        .unwrap_or_default();
                    yield Ok(Event::default().event("error").data(body));
                    return;
                }
            }
        }
        guard.disarm();
    };

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

async fn subscribe(State(state): State<AppState>, Json(req): Json<SubscribeRequest>) -> Response {
    let channel = state.runtime.channel();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<RawMessage>();
    let handler: RawHandler = Arc::new(move |raw| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(raw);
        })
    });
    let sub = match channel.subscribe(req.addr, handler, "").await {
        Ok(sub) => sub,
        Err(err) => return error_response(&err),
    };

    let events = envelope_events(rx, UnsubscribeOnDrop(Some(sub)));
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

fn envelope_events(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<RawMessage>,
    guard: UnsubscribeOnDrop,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let _guard = guard;
        while let Some(raw) = rx.recv().await {
            let data = raw.encode_json().unwrap_or_default();
            yield Ok(Event::default().data(data));
        }
    }
}

async fn reply_topics(State(state): State<AppState>) -> Response {
    match state.runtime.channel().new_reply_topic().await {
        Ok(topic) => Json(serde_json::json!({ "topic": topic })).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn discovery(
    State(state): State<AppState>,
    Query(params): Query<DiscoveryParams>,
) -> Response {
    let query = DiscoveryQuery {
        namespace: params.namespace,
        recursive: params.recursive,
        inclusive: params.inclusive,
        detailed: params.detailed,
    };
    let msg = match query.encode() {
        Ok(msg) => msg,
        Err(err) => return error_response(&err),
    };

    let result = state
        .runtime
        .channel()
        .publish(
            Address::factory("discovery"),
            msg,
            PublishOptions::request().probe(false),
        )
        .await;

    match result {
        Ok(Some(raw)) => match DiscoveryReply::decode(&raw) {
            Ok(reply) => Json(reply).into_response(),
            Err(err) => error_response(&err),
        },
        Ok(None) => error_response(&Error::Channel("no discovery reply".to_string())),
        Err(err) => error_response(&err),
    }
}
