//! Two-tier service discovery.
//!
//! Each process runs a [`DiscoveryServer`] holding the local registry (a
//! trie of agent schemas) plus the table of peers subscribed to
//! registration changes. The cluster-facing [`Discovery`] aggregator sits
//! behind the `discovery` address in a queue group: it scatters each query
//! to every server, gathers replies inside a fixed window, deduplicates and
//! sorts. The gather window is deliberately shorter than the caller's
//! request timeout; that relationship is a contract, not a tuning knob.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::address::{Address, DISCOVERY_NAME, DISCOVERY_SERVER_NAME};
use crate::agent::Operation;
use crate::channel::{Channel, DynSubscription, PublishOptions, RawHandler};
use crate::error::{Error, Result};
use crate::message::{Empty, Message, ProbeAgent, RawMessage, Started, Stopped};
use crate::trie::Trie;

/// How long the aggregator collects server replies. Strictly below the
/// default request timeout of 500 ms.
pub const DEFAULT_GATHER_WINDOW: Duration = Duration::from_millis(450);

/// How long a starting server waits for peers' subscription tables.
pub const DEFAULT_SYNC_WINDOW: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The registered shape of an agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Schema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<Operation>,
}

impl Schema {
    fn brief(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            operations: Vec::new(),
        }
    }
}

/// A query for agents registered under a namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DiscoveryQuery {
    /// The namespace to search; empty matches everything.
    #[serde(default)]
    pub namespace: String,
    /// Include descendants deeper than direct children.
    #[serde(default)]
    pub recursive: bool,
    /// Include the agent whose name equals the namespace itself.
    #[serde(default)]
    pub inclusive: bool,
    /// Return the operations of each agent, not just name and description.
    #[serde(default)]
    pub detailed: bool,
}

impl Message for DiscoveryQuery {
    const NAME: &'static str = "DiscoveryQuery";
}

impl DiscoveryQuery {
    /// Whether a registered name matches this query.
    ///
    /// Matching is segment-aligned: equality counts only when `inclusive`,
    /// direct children always count, deeper descendants only when
    /// `recursive`.
    pub fn matches(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        if self.namespace.is_empty() {
            return self.recursive || !name.contains('.');
        }
        if name == self.namespace {
            return self.inclusive;
        }
        let Some(rest) = name
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            return false;
        };
        self.recursive || !rest.contains('.')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DiscoveryReply {
    pub agents: Vec<Schema>,
}

impl Message for DiscoveryReply {
    const NAME: &'static str = "DiscoveryReply";
}

/// Subscribe `sender` to registration/deregistration events matching
/// `query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SubscribeToAgentUpdates {
    pub sender: Address,
    pub query: DiscoveryQuery,
}

impl Message for SubscribeToAgentUpdates {
    const NAME: &'static str = "SubscribeToAgentUpdates";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnsubscribeFromAgentUpdates {
    pub sender: Address,
}

impl Message for UnsubscribeFromAgentUpdates {
    const NAME: &'static str = "UnsubscribeFromAgentUpdates";
}

/// Pushed to subscribers when matching agents are registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentsRegistered {
    pub agents: Vec<Schema>,
}

impl Message for AgentsRegistered {
    const NAME: &'static str = "AgentsRegistered";
}

/// Pushed to subscribers when matching agents are deregistered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentsDeregistered {
    pub agents: Vec<Schema>,
}

impl Message for AgentsDeregistered {
    const NAME: &'static str = "AgentsDeregistered";
}

/// Internal: a starting server asks its peers for their subscription
/// tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SynchronizeQuery {}

impl Message for SynchronizeQuery {
    const NAME: &'static str = "_SynchronizeQuery";
}

/// Internal: a peer's subscription table, keyed by subscriber topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SynchronizeReply {
    pub subscriptions: HashMap<String, DiscoveryQuery>,
}

impl Message for SynchronizeReply {
    const NAME: &'static str = "_SynchronizeReply";
}

// ---------------------------------------------------------------------------
// DiscoveryServer
// ---------------------------------------------------------------------------

/// The process-local registry tier.
pub struct DiscoveryServer {
    channel: Arc<dyn Channel>,
    address: Address,
    sync_window: Duration,
    schemas: tokio::sync::Mutex<Trie<Schema>>,
    subscriptions: tokio::sync::Mutex<HashMap<Address, DiscoveryQuery>>,
    sub: tokio::sync::Mutex<Option<DynSubscription>>,
}

impl DiscoveryServer {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            address: Address::factory(DISCOVERY_SERVER_NAME),
            sync_window: DEFAULT_SYNC_WINDOW,
            schemas: tokio::sync::Mutex::new(Trie::new()),
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
            sub: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_sync_window(mut self, window: Duration) -> Self {
        self.sync_window = window;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Absorb peers' subscription tables, then subscribe to the shared
    /// server topic. Synchronizing before subscribing means the server
    /// never sees its own `_SynchronizeQuery`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let inbox = self.channel.new_reply_topic().await?;
        let server = Arc::clone(self);
        let gather: RawHandler = Arc::new(move |raw| {
            let server = Arc::clone(&server);
            Box::pin(async move {
                match SynchronizeReply::decode(&raw) {
                    Ok(reply) => server.absorb_subscriptions(reply).await,
                    Err(err) => warn!(%err, "bad synchronize reply"),
                }
            })
        });
        let sub = self
            .channel
            .subscribe(Address::reply(&inbox), gather, "")
            .await?;

        self.channel
            .publish(
                self.address.clone(),
                (SynchronizeQuery {}).encode()?,
                PublishOptions::request().reply(&inbox).probe(false),
            )
            .await?;
        tokio::time::sleep(self.sync_window).await;
        sub.unsubscribe().await?;

        let server = Arc::clone(self);
        let handler: RawHandler = Arc::new(move |raw| {
            let server = Arc::clone(&server);
            Box::pin(async move { server.receive(raw).await })
        });
        let sub = self
            .channel
            .subscribe(self.address.clone(), handler, "")
            .await?;
        *self.sub.lock().await = Some(sub);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(sub) = self.sub.lock().await.take() {
            sub.unsubscribe().await?;
        }
        Ok(())
    }

    async fn absorb_subscriptions(&self, reply: SynchronizeReply) {
        let mut subscriptions = self.subscriptions.lock().await;
        for (topic, query) in reply.subscriptions {
            match Address::from_topic(&topic) {
                Ok(addr) => {
                    subscriptions.insert(addr, query);
                }
                Err(err) => warn!(topic = %topic, %err, "bad subscriber topic"),
            }
        }
    }

    /// Register an agent type. Rejects the reserved server name and
    /// duplicates, then notifies matching update subscribers.
    pub async fn register(
        &self,
        name: &str,
        description: &str,
        operations: Vec<Operation>,
    ) -> Result<()> {
        if name == DISCOVERY_SERVER_NAME {
            return Err(Error::Config(format!("agent type '{name}' is reserved")));
        }
        {
            let mut schemas = self.schemas.lock().await;
            if schemas.contains_key(name) {
                return Err(Error::Config(format!(
                    "agent type '{name}' already registered"
                )));
            }
            schemas.insert(
                name,
                Schema {
                    name: name.to_string(),
                    description: description.to_string(),
                    operations,
                },
            );
        }
        info!(agent = name, "registered agent type");

        let subscriptions = self.subscriptions.lock().await.clone();
        for (addr, query) in subscriptions {
            if !query.matches(name) {
                continue;
            }
            let msg = AgentsRegistered {
                agents: vec![Schema::brief(name, description)],
            };
            self.notify(&addr, msg.encode()).await;
        }
        Ok(())
    }

    /// Deregister agent types (all of them when `names` is empty) and
    /// notify matching update subscribers.
    pub async fn deregister(&self, names: &[String]) -> Result<()> {
        let mut removed: Vec<String> = Vec::new();
        {
            let mut schemas = self.schemas.lock().await;
            if names.is_empty() {
                removed = schemas.keys();
                schemas.clear();
            } else {
                for name in names {
                    if schemas.remove(name).is_some() {
                        removed.push(name.clone());
                    }
                }
            }
        }
        if removed.is_empty() {
            return Ok(());
        }
        info!(agents = ?removed, "deregistered agent types");

        let subscriptions = self.subscriptions.lock().await.clone();
        for (addr, query) in subscriptions {
            let matched: Vec<Schema> = removed
                .iter()
                .filter(|name| query.matches(name))
                .map(|name| Schema::brief(name, ""))
                .collect();
            if matched.is_empty() {
                continue;
            }
            let msg = AgentsDeregistered { agents: matched };
            self.notify(&addr, msg.encode()).await;
        }
        Ok(())
    }

    async fn notify(&self, addr: &Address, msg: Result<RawMessage>) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(%err, "failed to encode notification");
                return;
            }
        };
        if let Err(err) = self
            .channel
            .publish(addr.clone(), msg, PublishOptions::default())
            .await
        {
            warn!(subscriber = %addr, %err, "failed to notify subscriber");
        }
    }

    /// Answer a query from the local registry.
    async fn search(&self, query: &DiscoveryQuery) -> DiscoveryReply {
        let found = {
            let schemas = self.schemas.lock().await;
            if query.recursive {
                schemas.values(&query.namespace)
            } else {
                schemas.direct_values(&query.namespace)
            }
        };

        let mut agents: Vec<Schema> = found
            .into_iter()
            .filter(|schema| query.inclusive || schema.name != query.namespace)
            .map(|schema| Schema {
                operations: if query.detailed {
                    schema.operations
                } else {
                    Vec::new()
                },
                name: schema.name,
                description: schema.description,
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        DiscoveryReply { agents }
    }

    async fn receive(self: Arc<Self>, raw: RawMessage) {
        debug!(r#type = %raw.header.r#type, "discovery server received message");
        match raw.header.r#type.as_str() {
            DiscoveryQuery::NAME => match DiscoveryQuery::decode(&raw) {
                Ok(query) => {
                    let reply = self.search(&query).await;
                    self.respond(raw.reply.as_ref(), reply.encode()).await;
                }
                Err(err) => self.respond(raw.reply.as_ref(), Ok(err.to_raw())).await,
            },
            SynchronizeQuery::NAME => {
                let subscriptions = self.subscriptions.lock().await;
                let reply = SynchronizeReply {
                    subscriptions: subscriptions
                        .iter()
                        .map(|(addr, query)| (addr.topic(), query.clone()))
                        .collect(),
                };
                drop(subscriptions);
                self.respond(raw.reply.as_ref(), reply.encode()).await;
            }
            SubscribeToAgentUpdates::NAME => match SubscribeToAgentUpdates::decode(&raw) {
                Ok(msg) => {
                    self.subscriptions.lock().await.insert(msg.sender, msg.query);
                }
                Err(err) => warn!(%err, "bad subscribe request"),
            },
            UnsubscribeFromAgentUpdates::NAME => {
                match UnsubscribeFromAgentUpdates::decode(&raw) {
                    Ok(msg) => {
                        self.subscriptions.lock().await.remove(&msg.sender);
                    }
                    Err(err) => warn!(%err, "bad unsubscribe request"),
                }
            }
            Started::NAME | Stopped::NAME | ProbeAgent::NAME | Empty::NAME => {}
            other => {
                let err = Error::MessageDecode(format!("message type '{other}' not found"));
                self.respond(raw.reply.as_ref(), Ok(err.to_raw())).await;
            }
        }
    }

    async fn respond(&self, reply: Option<&Address>, msg: Result<RawMessage>) {
        let Some(reply) = reply else { return };
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => err.to_raw(),
        };
        if let Err(err) = self
            .channel
            .publish(reply.clone(), msg, PublishOptions::default())
            .await
        {
            error!(%err, "failed to publish discovery reply");
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery (aggregator)
// ---------------------------------------------------------------------------

/// The cluster-facing aggregator behind the `discovery` address.
///
/// Stateless with respect to the registry: queries scatter to the local
/// server topic (reaching every server on the broker) and gather inside a
/// fixed window, so no knowledge of cluster size is needed.
pub struct Discovery {
    channel: Arc<dyn Channel>,
    address: Address,
    gather_window: Duration,
    sync_window: Duration,
    server: tokio::sync::Mutex<Option<Arc<DiscoveryServer>>>,
    sub: tokio::sync::Mutex<Option<DynSubscription>>,
}

impl Discovery {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            address: Address::factory(DISCOVERY_NAME),
            gather_window: DEFAULT_GATHER_WINDOW,
            sync_window: DEFAULT_SYNC_WINDOW,
            server: tokio::sync::Mutex::new(None),
            sub: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_windows(mut self, gather: Duration, sync: Duration) -> Self {
        self.gather_window = gather;
        self.sync_window = sync;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Each query is handled by exactly one aggregator in the cluster.
        let aggregator = Arc::clone(self);
        let handler: RawHandler = Arc::new(move |raw| {
            let aggregator = Arc::clone(&aggregator);
            Box::pin(async move { aggregator.receive(raw).await })
        });
        let queue = format!("{}_workers", self.address.topic());
        let sub = self
            .channel
            .subscribe(self.address.clone(), handler, &queue)
            .await?;
        *self.sub.lock().await = Some(sub);

        let server = Arc::new(
            DiscoveryServer::new(self.channel.clone()).with_sync_window(self.sync_window),
        );
        server.start().await?;
        *self.server.lock().await = Some(server);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(server) = self.server.lock().await.take() {
            server.stop().await?;
        }
        if let Some(sub) = self.sub.lock().await.take() {
            sub.unsubscribe().await?;
        }
        Ok(())
    }

    pub async fn register(
        &self,
        name: &str,
        description: &str,
        operations: Vec<Operation>,
    ) -> Result<()> {
        if name == DISCOVERY_NAME {
            return Err(Error::Config(format!("agent type '{name}' is reserved")));
        }
        let server = self.server.lock().await.clone();
        match server {
            Some(server) => server.register(name, description, operations).await,
            None => Err(Error::Config("discovery not started".to_string())),
        }
    }

    pub async fn deregister(&self, names: &[String]) -> Result<()> {
        let server = self.server.lock().await.clone();
        match server {
            Some(server) => server.deregister(names).await,
            None => Ok(()),
        }
    }

    /// Scatter a query to all discovery servers, gather replies inside the
    /// window, deduplicate by name and sort.
    async fn aggregate(&self, query: &DiscoveryQuery) -> Result<DiscoveryReply> {
        let server_addr = {
            let server = self.server.lock().await;
            match server.as_ref() {
                Some(server) => server.address().clone(),
                None => return Err(Error::Config("discovery not started".to_string())),
            }
        };

        let gathered: Arc<tokio::sync::Mutex<HashMap<String, Schema>>> =
            Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let sink = Arc::clone(&gathered);
        let gather: RawHandler = Arc::new(move |raw| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                match DiscoveryReply::decode(&raw) {
                    Ok(reply) => {
                        let mut gathered = sink.lock().await;
                        for agent in reply.agents {
                            gathered.insert(agent.name.clone(), agent);
                        }
                    }
                    Err(err) => warn!(%err, "bad discovery reply"),
                }
            })
        });

        let inbox = self.channel.new_reply_topic().await?;
        let sub = self
            .channel
            .subscribe(Address::reply(&inbox), gather, "")
            .await?;

        let result = self
            .channel
            .publish(
                server_addr,
                query.encode()?,
                PublishOptions::request().reply(&inbox).probe(false),
            )
            .await;
        if result.is_ok() {
            tokio::time::sleep(self.gather_window).await;
        }
        sub.unsubscribe().await?;
        result?;

        let mut agents: Vec<Schema> = {
            let mut gathered = gathered.lock().await;
            std::mem::take(&mut *gathered).into_values().collect()
        };
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(DiscoveryReply { agents })
    }

    async fn forward_to_server(&self, raw: RawMessage) {
        let server_addr = {
            let server = self.server.lock().await;
            match server.as_ref() {
                Some(server) => server.address().clone(),
                None => return,
            }
        };
        let mut forwarded = raw;
        forwarded.reply = None;
        if let Err(err) = self
            .channel
            .publish(
                server_addr,
                forwarded,
                PublishOptions::default().probe(false),
            )
            .await
        {
            error!(%err, "failed to forward to discovery server");
        }
    }

    async fn receive(self: Arc<Self>, raw: RawMessage) {
        debug!(r#type = %raw.header.r#type, "discovery received message");
        let kind = raw.header.r#type.clone();
        match kind.as_str() {
            DiscoveryQuery::NAME => match DiscoveryQuery::decode(&raw) {
                Ok(query) => {
                    let reply = self.aggregate(&query).await;
                    let out = reply.and_then(|reply| reply.encode());
                    self.respond(raw.reply.as_ref(), out).await;
                }
                Err(err) => self.respond(raw.reply.as_ref(), Ok(err.to_raw())).await,
            },
            SubscribeToAgentUpdates::NAME | UnsubscribeFromAgentUpdates::NAME => {
                self.forward_to_server(raw).await;
            }
            Started::NAME | Stopped::NAME | ProbeAgent::NAME | Empty::NAME => {}
            other => {
                let err = Error::MessageDecode(format!("message type '{other}' not found"));
                self.respond(raw.reply.as_ref(), Ok(err.to_raw())).await;
            }
        }
    }

    async fn respond(&self, reply: Option<&Address>, msg: Result<RawMessage>) {
        let Some(reply) = reply else { return };
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => err.to_raw(),
        };
        if let Err(err) = self
            .channel
            .publish(reply.clone(), msg, PublishOptions::default())
            .await
        {
            error!(%err, "failed to publish discovery reply");
        }
    }
}
