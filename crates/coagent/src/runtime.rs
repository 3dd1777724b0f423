//! The runtime façade.
//!
//! Wires a channel, the discovery aggregator and the per-type factories
//! together. Agent types are described by an [`AgentSpec`] (name,
//! description, constructor, introspected operations); registering a spec
//! publishes it to discovery and starts its factory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::address::Address;
use crate::agent::{collect_operations, Agent, BaseAgent, Handlers, Operation};
use crate::channel::{
    Channel, LocalChannel, MessageStream, NatsChannel, PublishOptions, DEFAULT_REQUEST_TIMEOUT,
};
use crate::discovery::{Discovery, DEFAULT_GATHER_WINDOW, DEFAULT_SYNC_WINDOW};
use crate::error::{Error, Result};
use crate::factory::{Constructor, DeleteAgent, Factory, DEFAULT_RECYCLE_INTERVAL};
use crate::message::{Message, RawMessage};

/// Tunables for a runtime's internal agents.
///
/// The discovery gather window must stay strictly below the request
/// timeout used by discovery clients.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub discovery_gather_window: Duration,
    pub discovery_sync_window: Duration,
    pub factory_recycle_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            discovery_gather_window: DEFAULT_GATHER_WINDOW,
            discovery_sync_window: DEFAULT_SYNC_WINDOW,
            factory_recycle_interval: DEFAULT_RECYCLE_INTERVAL,
        }
    }
}

/// The runtime: a channel, a discovery aggregator and the local factories.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    channel: Arc<dyn Channel>,
    config: RuntimeConfig,
    discovery: tokio::sync::Mutex<Option<Arc<Discovery>>>,
    factories: tokio::sync::Mutex<HashMap<String, Arc<Factory>>>,
}

impl Runtime {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self::with_config(channel, RuntimeConfig::default())
    }

    pub fn with_config(channel: Arc<dyn Channel>, config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                channel,
                config,
                discovery: tokio::sync::Mutex::new(None),
                factories: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A runtime over the in-process broker.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalChannel::new()))
    }

    /// A runtime over a NATS cluster.
    pub fn nats(servers: impl Into<String>) -> Self {
        Self::new(Arc::new(NatsChannel::new(servers)))
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        self.inner.channel.clone()
    }

    /// Connect the channel and start the discovery tier.
    pub async fn start(&self) -> Result<()> {
        self.inner.channel.connect().await?;

        let discovery = Arc::new(Discovery::new(self.inner.channel.clone()).with_windows(
            self.inner.config.discovery_gather_window,
            self.inner.config.discovery_sync_window,
        ));
        discovery.start().await?;
        *self.inner.discovery.lock().await = Some(discovery);
        info!("runtime started");
        Ok(())
    }

    /// Stop discovery, deregister every agent type and close the channel.
    pub async fn stop(&self) -> Result<()> {
        if let Some(discovery) = self.inner.discovery.lock().await.as_ref() {
            discovery.stop().await?;
        }
        self.deregister(&[]).await?;
        self.inner.channel.close().await?;
        info!("runtime stopped");
        Ok(())
    }

    /// Register an agent type: publish its schema to discovery and start
    /// its factory. Duplicate names are rejected.
    pub async fn register(&self, spec: AgentSpec) -> Result<()> {
        spec.attach(self.clone());

        {
            let discovery = self.inner.discovery.lock().await;
            let discovery = discovery
                .as_ref()
                .ok_or_else(|| Error::Config("runtime not started".to_string()))?;
            discovery
                .register(spec.name(), spec.description(), spec.operations())
                .await?;
        }

        let mut factories = self.inner.factories.lock().await;
        if factories.contains_key(spec.name()) {
            return Err(Error::Config(format!(
                "agent type '{}' already registered",
                spec.name()
            )));
        }

        let factory = Arc::new(
            Factory::new(spec.name(), spec.constructor(), self.inner.channel.clone())
                .with_recycle_interval(self.inner.config.factory_recycle_interval),
        );
        Arc::clone(&factory).start().await?;
        factories.insert(spec.name().to_string(), factory);
        Ok(())
    }

    /// Stop the named factories (all of them when `names` is empty) and
    /// deregister them from discovery.
    pub async fn deregister(&self, names: &[&str]) -> Result<()> {
        let stopped: Vec<(String, Arc<Factory>)> = {
            let mut factories = self.inner.factories.lock().await;
            if names.is_empty() {
                factories.drain().collect()
            } else {
                names
                    .iter()
                    .filter_map(|name| {
                        factories
                            .remove(*name)
                            .map(|factory| (name.to_string(), factory))
                    })
                    .collect()
            }
        };
        for (name, factory) in &stopped {
            if let Err(err) = factory.stop().await {
                warn!(factory = %name, %err, "failed to stop factory");
            }
        }

        if let Some(discovery) = self.inner.discovery.lock().await.as_ref() {
            let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
            discovery.deregister(&names).await?;
        }
        Ok(())
    }

    /// Ask the owning factory to delete a session agent. Best-effort under
    /// factory replication.
    pub async fn delete(&self, addr: &Address) -> Result<()> {
        let msg = DeleteAgent {
            session_id: addr.id.clone(),
        }
        .encode()?;
        self.inner
            .channel
            .publish(
                Address::factory(addr.name.clone()),
                msg,
                PublishOptions::default().probe(false),
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AgentSpec
// ---------------------------------------------------------------------------

/// The registerable description of an agent type.
///
/// Cheap to clone; the same spec can be held by callers after registration
/// to run one-shot sessions against the type.
#[derive(Clone)]
pub struct AgentSpec {
    inner: Arc<SpecInner>,
}

struct SpecInner {
    name: String,
    description: String,
    constructor: Constructor,
    operations: Vec<Operation>,
    runtime: Mutex<Option<Runtime>>,
}

impl AgentSpec {
    /// Describe an agent type whose sessions are built from `make`.
    pub fn new<H, F>(name: impl Into<String>, description: impl Into<String>, make: F) -> Self
    where
        H: Handlers,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let constructor: Constructor = Arc::new(move |channel, address| {
            let agent: Arc<dyn Agent> = BaseAgent::new(make(), channel, address);
            Ok(agent)
        });
        Self {
            inner: Arc::new(SpecInner {
                name: name.into(),
                description: description.into(),
                constructor,
                operations: collect_operations::<H>(),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.inner.operations.clone()
    }

    pub(crate) fn constructor(&self) -> Constructor {
        Arc::clone(&self.inner.constructor)
    }

    fn attach(&self, runtime: Runtime) {
        *self.inner.runtime.lock().unwrap() = Some(runtime);
    }

    fn runtime(&self) -> Result<Runtime> {
        self.inner.runtime.lock().unwrap().clone().ok_or_else(|| {
            Error::Config(format!(
                "agent spec '{}' is not registered to a runtime",
                self.inner.name
            ))
        })
    }

    /// Run a fresh session of this agent type with one request.
    pub async fn run(&self, msg: RawMessage, timeout: Option<Duration>) -> Result<RawMessage> {
        let runtime = self.runtime()?;
        let addr = Address::new(self.name(), uuid::Uuid::new_v4().simple().to_string());
        let reply = runtime
            .channel()
            .publish(
                addr,
                msg,
                PublishOptions::request().timeout(timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)),
            )
            .await?;
        reply.ok_or_else(|| Error::Channel("request returned no reply".to_string()))
    }

    /// Run a fresh session of this agent type with a streaming request.
    pub async fn run_stream(&self, msg: RawMessage) -> Result<MessageStream> {
        let runtime = self.runtime()?;
        let addr = Address::new(self.name(), uuid::Uuid::new_v4().simple().to_string());
        runtime.channel().publish_multi(addr, msg, true).await
    }
}
