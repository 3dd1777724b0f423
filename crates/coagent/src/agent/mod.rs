//! Agents: stateful receivers bound to a channel and an address.
//!
//! User behaviors implement [`Handlers`]; a [`BaseAgent`] wraps the
//! behavior with the runtime machinery — subscription, handler dispatch,
//! the reply protocol, idle tracking and cancellation. Each inbound message
//! spawns exactly one handler task, so a later `Cancel` can target the
//! running handler without stalling the message loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::address::Address;
use crate::channel::{Channel, DynSubscription, PublishOptions, RawHandler};
use crate::error::{Error, Result};
use crate::message::{
    Cancel, Empty, Extensions, Message, ProbeAgent, RawMessage, SetReplyAgent, Started,
    StopIteration, Stopped,
};

mod operations;

pub use operations::{HandlerOutput, IntoReply, Operation, Operations};

use operations::InvokeFn;

/// Default inactivity window before an agent reports [`AgentState::Idle`].
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-message context passed to handlers.
#[derive(Clone)]
pub struct Context {
    /// The channel the agent is bound to.
    pub channel: Arc<dyn Channel>,
    /// The agent's own address.
    pub address: Address,
    /// Reply address of the message being handled, if any.
    pub reply: Option<Address>,
    /// Extension fields of the message being handled, verbatim.
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Running,
    /// No message received within the idle timeout; the factory will
    /// recycle the agent on its next tick.
    Idle,
}

/// A live, addressable agent.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn address(&self) -> &Address;

    async fn state(&self) -> AgentState;

    async fn start(self: Arc<Self>) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Handle one inbound envelope. Invoked by the channel subscription.
    async fn receive(self: Arc<Self>, raw: RawMessage);
}

/// The behavior of a user-defined agent.
#[async_trait]
pub trait Handlers: Sized + Send + Sync + 'static {
    /// Register the message handlers of this agent type. The table built
    /// here is fixed for the lifetime of each instance.
    fn operations(ops: &mut Operations<Self>);

    /// Inactivity window after which the agent reports idle and becomes a
    /// candidate for recycling.
    fn idle_timeout(&self) -> Duration {
        DEFAULT_IDLE_TIMEOUT
    }

    /// Called once the agent is subscribed and received its `Started`
    /// notification.
    async fn started(&self, _ctx: &Context) {}

    /// Called from the message loop when the agent is stopped, ordered
    /// after all previously delivered messages.
    async fn stopped(&self, _ctx: &Context) {}
}

/// Collect the introspection records of a behavior type without
/// constructing an instance.
pub fn collect_operations<H: Handlers>() -> Vec<Operation> {
    let mut ops = Operations::new();
    H::operations(&mut ops);
    ops.records()
}

// ---------------------------------------------------------------------------
// BaseAgent
// ---------------------------------------------------------------------------

/// Runtime wrapper around a [`Handlers`] behavior.
pub struct BaseAgent<H: Handlers> {
    channel: Arc<dyn Channel>,
    address: Address,
    state: Arc<H>,
    table: Operations<H>,
    idle_timeout: Duration,
    sub: tokio::sync::Mutex<Option<DynSubscription>>,
    /// Default reply address installed by `SetReplyAgent`; overrides the
    /// inbound message's reply during publication of outbound replies.
    reply_address: Mutex<Option<Address>>,
    last_msg_at: Mutex<Instant>,
    /// Cancellation token of the most recently spawned handler task.
    running: Mutex<Option<CancellationToken>>,
}

impl<H: Handlers> BaseAgent<H> {
    pub fn new(state: H, channel: Arc<dyn Channel>, address: Address) -> Arc<Self> {
        let mut table = Operations::new();
        H::operations(&mut table);
        let idle_timeout = state.idle_timeout();
        Arc::new(Self {
            channel,
            address,
            state: Arc::new(state),
            table,
            idle_timeout,
            sub: tokio::sync::Mutex::new(None),
            reply_address: Mutex::new(None),
            last_msg_at: Mutex::new(Instant::now()),
            running: Mutex::new(None),
        })
    }

    /// The wrapped behavior.
    pub fn handlers(&self) -> &Arc<H> {
        &self.state
    }

    fn context(&self, raw: Option<&RawMessage>) -> Context {
        Context {
            channel: self.channel.clone(),
            address: self.address.clone(),
            reply: raw.and_then(|r| r.reply.clone()),
            extensions: raw.map(|r| r.header.extensions.clone()).unwrap_or_default(),
        }
    }

    /// Publish one outbound reply to the effective reply address.
    async fn send_reply(&self, in_reply: Option<&Address>, out: RawMessage) {
        let target = { self.reply_address.lock().unwrap().clone() }
            .or_else(|| in_reply.cloned());
        let Some(addr) = target else {
            debug!(agent = %self.address, r#type = %out.header.r#type, "no reply address");
            return;
        };
        if let Err(err) = self
            .channel
            .publish(addr, out, PublishOptions::default())
            .await
        {
            error!(agent = %self.address, %err, "failed to publish reply");
        }
    }

    async fn dispatch(self: &Arc<Self>, raw: RawMessage) {
        let Some(entry) = self.table.lookup(&raw.header.r#type) else {
            let err = Error::MessageDecode(format!(
                "message type '{}' not found",
                raw.header.r#type
            ));
            if raw.reply.is_some() {
                self.send_reply(raw.reply.as_ref(), err.to_raw()).await;
            } else {
                error!(agent = %self.address, %err, "dropping message");
            }
            return;
        };
        let invoke = Arc::clone(&entry.invoke);

        let token = CancellationToken::new();
        *self.running.lock().unwrap() = Some(token.clone());

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let reply_to = raw.reply.clone();
            tokio::select! {
                _ = token.cancelled() => {
                    agent
                        .send_reply(reply_to.as_ref(), Error::Cancelled.to_raw())
                        .await;
                }
                _ = agent.run_handler(invoke, raw) => {}
            }
        });
    }

    async fn run_handler(&self, invoke: InvokeFn<H>, raw: RawMessage) {
        let ctx = self.context(Some(&raw));
        let reply_to = raw.reply.clone();

        match invoke(Arc::clone(&self.state), raw, ctx).await {
            Ok(HandlerOutput::None) => match (Empty {}).encode() {
                Ok(out) => self.send_reply(reply_to.as_ref(), out).await,
                Err(err) => self.send_reply(reply_to.as_ref(), err.to_raw()).await,
            },
            Ok(HandlerOutput::Single(out)) => self.send_reply(reply_to.as_ref(), out).await,
            Ok(HandlerOutput::Stream(mut stream)) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(out) => self.send_reply(reply_to.as_ref(), out).await,
                        Err(err) => {
                            // An error terminates the stream in place of the
                            // StopIteration marker.
                            self.send_reply(reply_to.as_ref(), err.to_raw()).await;
                            return;
                        }
                    }
                }
                match (StopIteration {}).encode() {
                    Ok(out) => self.send_reply(reply_to.as_ref(), out).await,
                    Err(err) => self.send_reply(reply_to.as_ref(), err.to_raw()).await,
                }
            }
            Err(err) => self.send_reply(reply_to.as_ref(), err.to_raw()).await,
        }
    }
}

#[async_trait]
impl<H: Handlers> Agent for BaseAgent<H> {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn state(&self) -> AgentState {
        let elapsed = self.last_msg_at.lock().unwrap().elapsed();
        if elapsed >= self.idle_timeout {
            AgentState::Idle
        } else {
            AgentState::Running
        }
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let agent = Arc::clone(&self);
        let handler: RawHandler = Arc::new(move |raw| {
            let agent = Arc::clone(&agent);
            Box::pin(async move { agent.receive(raw).await })
        });
        let sub = self
            .channel
            .subscribe(self.address.clone(), handler, "")
            .await?;
        *self.sub.lock().await = Some(sub);

        self.channel
            .publish(
                self.address.clone(),
                (Started {}).encode()?,
                PublishOptions::default().probe(false),
            )
            .await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.channel
            .publish(
                self.address.clone(),
                (Stopped {}).encode()?,
                PublishOptions::default().probe(false),
            )
            .await?;
        if let Some(sub) = self.sub.lock().await.take() {
            sub.unsubscribe().await?;
        }
        Ok(())
    }

    async fn receive(self: Arc<Self>, raw: RawMessage) {
        debug!(agent = %self.address, r#type = %raw.header.r#type, "received message");
        *self.last_msg_at.lock().unwrap() = Instant::now();

        let kind = raw.header.r#type.clone();
        match kind.as_str() {
            Started::NAME => {
                let ctx = self.context(Some(&raw));
                self.state.started(&ctx).await;
            }
            Stopped::NAME => {
                let ctx = self.context(Some(&raw));
                self.state.stopped(&ctx).await;
            }
            SetReplyAgent::NAME => match SetReplyAgent::decode(&raw) {
                Ok(msg) => {
                    *self.reply_address.lock().unwrap() = Some(msg.address);
                }
                Err(err) => self.send_reply(raw.reply.as_ref(), err.to_raw()).await,
            },
            ProbeAgent::NAME | Empty::NAME => {}
            Cancel::NAME => {
                let token = self.running.lock().unwrap().take();
                if let Some(token) = token {
                    token.cancel();
                }
            }
            _ => self.dispatch(raw).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::channel::LocalChannel;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
    struct Run {}

    impl Message for Run {
        const NAME: &'static str = "Run";
    }

    struct Blocking;

    #[async_trait]
    impl Handlers for Blocking {
        fn operations(ops: &mut Operations<Self>) {
            ops.on::<Run, (), _, _>("run", "Sleep forever.", |_state, _msg: Run, _ctx| {
                async move {
                    // Far longer than any test; only cancellation ends it.
                    tokio::time::sleep(Duration::from_secs(100)).await;
                    Ok(())
                }
            });
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_the_running_handler() {
        let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new());
        let agent = BaseAgent::new(Blocking, channel.clone(), Address::new("blocking", "0"));
        agent.clone().start().await.unwrap();

        agent.clone().receive((Run {}).encode().unwrap()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(agent.running.lock().unwrap().is_some());

        agent.clone().receive((Cancel {}).encode().unwrap()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The token was consumed; a later message still dispatches normally.
        assert!(agent.running.lock().unwrap().is_none());
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn idle_state_reflects_inactivity() {
        struct Quick;

        #[async_trait]
        impl Handlers for Quick {
            fn operations(_ops: &mut Operations<Self>) {}

            fn idle_timeout(&self) -> Duration {
                Duration::from_millis(20)
            }
        }

        let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new());
        let agent = BaseAgent::new(Quick, channel, Address::new("quick", "0"));

        assert_eq!(agent.state().await, AgentState::Running);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(agent.state().await, AgentState::Idle);

        // A fresh message resets the idle clock.
        agent.clone().receive((Empty {}).encode().unwrap()).await;
        assert_eq!(agent.state().await, AgentState::Running);
    }
}
