//! The statically-built handler dispatch table.
//!
//! Handlers are registered at agent-construction time, keyed by the wire
//! type name of the message they accept. Each registration also records an
//! [`Operation`]: the introspection record (name, description, message and
//! reply JSON schemas) that discovery serves for `detailed` queries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Context;
use crate::channel::MessageStream;
use crate::error::Result;
use crate::message::{Message, RawMessage};

/// Introspection record of one registered handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the message the handler accepts.
    #[serde(default = "empty_schema")]
    pub message: serde_json::Value,
    /// JSON schema of the reply it produces (`{}` when it replies nothing).
    #[serde(default = "empty_schema")]
    pub reply: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({})
}

/// What a handler invocation produced.
pub enum HandlerOutput {
    /// Nothing; normalized to an `Empty` reply.
    None,
    /// A single reply envelope.
    Single(RawMessage),
    /// A lazy sequence of reply envelopes, terminated by `StopIteration`.
    Stream(MessageStream),
}

impl HandlerOutput {
    pub fn message<M: Message>(msg: &M) -> Result<Self> {
        Ok(Self::Single(msg.encode()?))
    }
}

/// Conversion of handler return values into [`HandlerOutput`].
pub trait IntoReply {
    fn into_reply(self) -> Result<HandlerOutput>;
    fn reply_schema() -> serde_json::Value;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<HandlerOutput> {
        Ok(HandlerOutput::None)
    }

    fn reply_schema() -> serde_json::Value {
        empty_schema()
    }
}

impl<M: Message> IntoReply for M {
    fn into_reply(self) -> Result<HandlerOutput> {
        Ok(HandlerOutput::Single(self.encode()?))
    }

    fn reply_schema() -> serde_json::Value {
        M::schema()
    }
}

pub(crate) type InvokeFn<H> = Arc<
    dyn Fn(Arc<H>, RawMessage, Context) -> BoxFuture<'static, Result<HandlerOutput>>
        + Send
        + Sync,
>;

pub(crate) struct HandlerEntry<H> {
    pub(crate) operation: Operation,
    pub(crate) invoke: InvokeFn<H>,
}

impl<H> Clone for HandlerEntry<H> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            invoke: Arc::clone(&self.invoke),
        }
    }
}

/// The dispatch table under construction, parameterized by the agent state
/// type handlers receive.
pub struct Operations<H> {
    entries: HashMap<String, HandlerEntry<H>>,
    fallback: Option<HandlerEntry<H>>,
}

impl<H: Send + Sync + 'static> Default for Operations<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Send + Sync + 'static> Operations<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: None,
        }
    }

    /// Register a single-reply handler for messages of type `M`.
    ///
    /// The handler's return value becomes the reply: a typed message, or
    /// `()` which is normalized to an `Empty` reply.
    pub fn on<M, R, F, Fut>(&mut self, name: &str, description: &str, f: F)
    where
        M: Message,
        R: IntoReply + Send + 'static,
        F: Fn(Arc<H>, M, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let invoke: InvokeFn<H> = Arc::new(move |state, raw, ctx| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let msg = M::decode(&raw)?;
                f(state, msg, ctx).await?.into_reply()
            })
        });
        self.entries.insert(
            M::NAME.to_string(),
            HandlerEntry {
                operation: Operation {
                    name: name.to_string(),
                    description: description.to_string(),
                    message: M::schema(),
                    reply: R::reply_schema(),
                },
                invoke,
            },
        );
    }

    /// Register a streaming handler for messages of type `M`.
    ///
    /// The handler returns a stream of typed replies; the runtime publishes
    /// each item and appends the `StopIteration` terminator. An `Err` item
    /// ends the stream with an `Error` envelope instead.
    pub fn on_stream<M, R, S, F>(&mut self, name: &str, description: &str, f: F)
    where
        M: Message,
        R: Message,
        S: Stream<Item = Result<R>> + Send + 'static,
        F: Fn(Arc<H>, M, Context) -> S + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let invoke: InvokeFn<H> = Arc::new(move |state, raw, ctx| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let msg = M::decode(&raw)?;
                let stream = f(state, msg, ctx).map(|item| item.and_then(|m| m.encode()));
                Ok(HandlerOutput::Stream(Box::pin(stream)))
            })
        });
        self.entries.insert(
            M::NAME.to_string(),
            HandlerEntry {
                operation: Operation {
                    name: name.to_string(),
                    description: description.to_string(),
                    message: M::schema(),
                    reply: R::schema(),
                },
                invoke,
            },
        );
    }

    /// Register a catch-all handler receiving the raw envelope of any
    /// message type no typed handler matches.
    pub fn on_raw<F, Fut>(&mut self, name: &str, description: &str, f: F)
    where
        F: Fn(Arc<H>, RawMessage, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerOutput>> + Send + 'static,
    {
        let f = Arc::new(f);
        let invoke: InvokeFn<H> = Arc::new(move |state, raw, ctx| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(state, raw, ctx).await })
        });
        self.fallback = Some(HandlerEntry {
            operation: Operation {
                name: name.to_string(),
                description: description.to_string(),
                message: empty_schema(),
                reply: empty_schema(),
            },
            invoke,
        });
    }

    pub(crate) fn lookup(&self, type_name: &str) -> Option<&HandlerEntry<H>> {
        self.entries.get(type_name).or(self.fallback.as_ref())
    }

    /// The introspection records of every registered handler, sorted by
    /// operation name for deterministic discovery replies.
    pub fn records(&self) -> Vec<Operation> {
        let mut records: Vec<Operation> = self
            .entries
            .values()
            .chain(self.fallback.as_ref())
            .map(|entry| entry.operation.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}
