//! The abstract broker.
//!
//! A [`Channel`] delivers envelopes by topic and supports request/reply via
//! ephemeral `_INBOX.*` subjects. Bindings implement the low-level
//! primitives ([`Channel::send`], [`Channel::subscribe`],
//! [`Channel::new_reply_topic`]); the request/reply and streaming-reply
//! protocols are layered on top once, here, so every binding behaves the
//! same way.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::factory::CreateAgent;
use crate::message::{ErrorMessage, Message, RawMessage, StopIteration};

mod local;
mod nats;

pub use local::LocalChannel;
pub use nats::NatsChannel;

/// Default timeout for a single-reply request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Subscription callback invoked for every envelope delivered to the topic.
pub type RawHandler = Arc<dyn Fn(RawMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// A lazy sequence of reply envelopes.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<RawMessage>> + Send>>;

/// Handle to an active subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn unsubscribe(&self) -> Result<()>;
}

pub type DynSubscription = Arc<dyn Subscription>;

// ---------------------------------------------------------------------------
// Publish options
// ---------------------------------------------------------------------------

/// Options for [`Channel::publish`].
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Wait for a single reply (unless an explicit `reply` topic is given).
    pub request: bool,
    /// Explicit reply topic; replies flow there instead of back to the
    /// caller.
    pub reply: String,
    /// How long a request waits for its reply.
    pub timeout: Duration,
    /// Probe the target's factory before delivering to a session address.
    pub probe: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            request: false,
            reply: String::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            probe: true,
        }
    }
}

impl PublishOptions {
    pub fn request() -> Self {
        Self {
            request: true,
            ..Default::default()
        }
    }

    pub fn reply(mut self, topic: impl Into<String>) -> Self {
        self.reply = topic.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Low-level delivery of an envelope to a topic. `raw.reply` must
    /// already be set if a reply subject is wanted.
    async fn send(&self, topic: &str, raw: RawMessage) -> Result<()>;

    /// Subscribe `handler` to the address's topic. A non-empty `queue`
    /// joins the named queue group: each envelope is delivered to exactly
    /// one member of the group.
    async fn subscribe(
        &self,
        addr: Address,
        handler: RawHandler,
        queue: &str,
    ) -> Result<DynSubscription>;

    /// A fresh `_INBOX.*` topic unique to this connection.
    async fn new_reply_topic(&self) -> Result<String>;

    /// Publish an envelope.
    ///
    /// With `request` and no explicit reply topic, waits for one reply and
    /// returns it; a remote `Error` envelope is raised as the matching
    /// [`Error`] variant and no reply within the timeout is
    /// [`Error::DeliverTimeout`]. With an explicit reply topic the envelope
    /// is sent with that reply subject and the call returns immediately.
    async fn publish(
        &self,
        addr: Address,
        msg: RawMessage,
        opts: PublishOptions,
    ) -> Result<Option<RawMessage>> {
        if opts.probe && addr.needs_probe() {
            self.probe(&addr, opts.timeout).await?;
        }
        let topic = addr.topic();

        if opts.request && opts.reply.is_empty() {
            let inbox = self.new_reply_topic().await?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let handler: RawHandler = Arc::new(move |raw| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(raw);
                })
            });
            let sub = self.subscribe(Address::reply(&inbox), handler, "").await?;

            let send_result = self
                .send(&topic, msg.with_reply(Address::reply(&inbox)))
                .await;
            let reply = match send_result {
                Ok(()) => tokio::time::timeout(opts.timeout, rx.recv()).await,
                Err(err) => {
                    let _ = sub.unsubscribe().await;
                    return Err(err);
                }
            };
            let _ = sub.unsubscribe().await;

            return match reply {
                Err(_) => Err(Error::DeliverTimeout(opts.timeout)),
                Ok(None) => Err(Error::Channel("reply subscription closed".to_string())),
                Ok(Some(raw)) if raw.is::<ErrorMessage>() => {
                    Err(ErrorMessage::decode(&raw)?.into())
                }
                Ok(Some(raw)) => Ok(Some(raw)),
            };
        }

        if opts.request {
            let reply = Address::from_topic(&opts.reply)?;
            self.send(&topic, msg.with_reply(reply)).await?;
            return Ok(None);
        }

        self.send(&topic, msg).await?;
        Ok(None)
    }

    /// Publish a request and consume a streaming reply.
    ///
    /// The returned stream yields each reply envelope, terminates cleanly on
    /// the in-band `StopIteration`, and raises a decoded remote `Error` as
    /// its final item. The reply inbox is unsubscribed when the stream ends
    /// or is dropped.
    async fn publish_multi(
        &self,
        addr: Address,
        msg: RawMessage,
        probe: bool,
    ) -> Result<MessageStream> {
        let inbox = self.new_reply_topic().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: RawHandler = Arc::new(move |raw| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(raw);
            })
        });
        let sub = self.subscribe(Address::reply(&inbox), handler, "").await?;

        let published = self
            .publish(
                addr,
                msg,
                PublishOptions::request().reply(&inbox).probe(probe),
            )
            .await;
        if let Err(err) = published {
            let _ = sub.unsubscribe().await;
            return Err(err);
        }

        Ok(Box::pin(InboxStream::new(rx, sub)))
    }

    /// Ask the target's factory to create the session agent, waiting for
    /// the acknowledgement so the agent is subscribed before the caller's
    /// message goes out.
    async fn probe(&self, addr: &Address, timeout: Duration) -> Result<()> {
        debug!(agent = %addr, "probing factory");
        let factory = Address::factory(addr.name.clone());
        let msg = CreateAgent {
            session_id: addr.id.clone(),
        }
        .encode()?;
        self.publish(
            factory,
            msg,
            PublishOptions::request().timeout(timeout).probe(false),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InboxStream — client side of the streaming reply protocol
// ---------------------------------------------------------------------------

/// Adapts a reply-inbox subscription into a stream of envelopes, applying
/// the terminator protocol and releasing the subscription on exit.
struct InboxStream {
    rx: mpsc::UnboundedReceiver<RawMessage>,
    sub: Option<DynSubscription>,
    done: bool,
}

impl InboxStream {
    fn new(rx: mpsc::UnboundedReceiver<RawMessage>, sub: DynSubscription) -> Self {
        Self {
            rx,
            sub: Some(sub),
            done: false,
        }
    }

    fn release(&mut self) {
        self.done = true;
        let Some(sub) = self.sub.take() else { return };
        // Dropping may happen outside a runtime during shutdown; skip the
        // cleanup then rather than panic.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = sub.unsubscribe().await;
            });
        }
    }
}

impl Stream for InboxStream {
    type Item = Result<RawMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.release();
                Poll::Ready(None)
            }
            Poll::Ready(Some(raw)) => {
                if raw.is::<StopIteration>() {
                    self.release();
                    return Poll::Ready(None);
                }
                if raw.is::<ErrorMessage>() {
                    self.release();
                    let err = match ErrorMessage::decode(&raw) {
                        Ok(msg) => msg.into(),
                        Err(err) => err,
                    };
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Some(Ok(raw)))
            }
        }
    }
}

impl Drop for InboxStream {
    fn drop(&mut self) {
        if !self.done {
            self.release();
        }
    }
}
