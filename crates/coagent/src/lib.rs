//! # Coagent — a distributed agent runtime
//!
//! Lightweight addressable agents exchange typed messages over a pluggable
//! broker. The crate is organised in dependency order:
//!
//! | Module      | Purpose                                                |
//! |-------------|--------------------------------------------------------|
//! | `address`   | Logical addresses and the canonical topic codec        |
//! | `message`   | The wire envelope, typed messages, control messages    |
//! | `channel`   | The abstract broker plus local and NATS bindings       |
//! | `agent`     | Handler dispatch, lifecycle, idle state, cancellation  |
//! | `factory`   | On-demand session agent creation and idle recycling    |
//! | `discovery` | Hierarchical registry with live update subscriptions   |
//! | `runtime`   | The façade wiring channel + discovery + factories      |
//!
//! A minimal server:
//!
//! ```no_run
//! use std::sync::Arc;
//! use coagent::{AgentSpec, Context, Handlers, Message, Operations, Runtime};
//! use schemars::JsonSchema;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
//! struct Ping {}
//! impl Message for Ping {
//!     const NAME: &'static str = "Ping";
//! }
//!
//! #[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
//! struct Pong {}
//! impl Message for Pong {
//!     const NAME: &'static str = "Pong";
//! }
//!
//! struct Server;
//!
//! impl Handlers for Server {
//!     fn operations(ops: &mut Operations<Self>) {
//!         ops.on::<Ping, Pong, _, _>("ping", "Answer a ping.", |_: Arc<Self>, _, _: Context| {
//!             async move { Ok(Pong {}) }
//!         });
//!     }
//! }
//!
//! # async fn run() -> coagent::Result<()> {
//! let runtime = Runtime::local();
//! runtime.start().await?;
//! runtime
//!     .register(AgentSpec::new("server", "A ping server.", || Server))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod agent;
pub mod channel;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod message;
pub mod runtime;
pub mod trie;

pub use address::Address;
pub use agent::{
    Agent, AgentState, BaseAgent, Context, HandlerOutput, Handlers, Operation, Operations,
};
pub use channel::{
    Channel, DynSubscription, LocalChannel, MessageStream, NatsChannel, PublishOptions,
    RawHandler, Subscription, DEFAULT_REQUEST_TIMEOUT,
};
pub use discovery::{
    AgentsDeregistered, AgentsRegistered, DiscoveryQuery, DiscoveryReply, Schema,
    SubscribeToAgentUpdates, UnsubscribeFromAgentUpdates,
};
pub use error::{Error, Result};
pub use factory::{Constructor, CreateAgent, DeleteAgent, Factory};
pub use message::{
    Cancel, Empty, ErrorMessage, Extensions, Message, MessageHeader, ProbeAgent, RawMessage,
    SetReplyAgent, Started, StopIteration, Stopped, JSON_CONTENT_TYPE,
};
pub use runtime::{AgentSpec, Runtime, RuntimeConfig};
