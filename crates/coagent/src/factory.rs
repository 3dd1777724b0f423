//! Factory agents: one singleton per agent type.
//!
//! A factory subscribes to its factory topic with a queue group so that a
//! `CreateAgent` request is handled by exactly one replica, spawns session
//! agents on demand, and recycles instances that have gone idle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::address::Address;
use crate::agent::{Agent, AgentState};
use crate::channel::{Channel, DynSubscription, PublishOptions, RawHandler};
use crate::error::{Error, Result};
use crate::message::{Empty, Message, ProbeAgent, RawMessage, Started, Stopped};

/// How often a factory sweeps its session agents for idle instances.
pub const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(20);

/// Builds a session agent bound to the given channel and address.
pub type Constructor =
    Arc<dyn Fn(Arc<dyn Channel>, Address) -> Result<Arc<dyn Agent>> + Send + Sync>;

/// A message to create the session agent for a session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CreateAgent {
    pub session_id: String,
}

impl Message for CreateAgent {
    const NAME: &'static str = "CreateAgent";
}

/// A message to delete the session agent of a session id.
///
/// Best-effort under load-balanced factories: the queue group may route the
/// request to a replica that does not hold the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeleteAgent {
    pub session_id: String,
}

impl Message for DeleteAgent {
    const NAME: &'static str = "DeleteAgent";
}

/// The per-type singleton that spawns and recycles session agents.
pub struct Factory {
    name: String,
    constructor: Constructor,
    channel: Arc<dyn Channel>,
    address: Address,
    recycle_interval: Duration,
    agents: tokio::sync::Mutex<HashMap<Address, Arc<dyn Agent>>>,
    sub: tokio::sync::Mutex<Option<DynSubscription>>,
    recycle_task: Mutex<Option<tokio::task::AbortHandle>>,
}

impl Factory {
    pub fn new(name: impl Into<String>, constructor: Constructor, channel: Arc<dyn Channel>) -> Self {
        let name = name.into();
        Self {
            address: Address::factory(name.clone()),
            name,
            constructor,
            channel,
            recycle_interval: DEFAULT_RECYCLE_INTERVAL,
            agents: tokio::sync::Mutex::new(HashMap::new()),
            sub: tokio::sync::Mutex::new(None),
            recycle_task: Mutex::new(None),
        }
    }

    pub fn with_recycle_interval(mut self, interval: Duration) -> Self {
        self.recycle_interval = interval;
        self
    }

    /// Number of live session agents held by this replica.
    pub async fn agent_count(&self) -> usize {
        self.agents.lock().await.len()
    }

    async fn create_agent(&self, session_id: &str) -> Result<()> {
        let addr = Address::new(self.name.clone(), session_id);
        let mut agents = self.agents.lock().await;
        if agents.contains_key(&addr) {
            return Ok(());
        }

        debug!(agent = %addr, "creating session agent");
        let agent = (self.constructor)(self.channel.clone(), addr.clone())?;
        agents.insert(addr, agent.clone());
        // Started while the map is locked, so a racing create for the same
        // session observes the inserted instance.
        agent.start().await
    }

    async fn delete_agent(&self, session_id: &str) {
        let addr = Address::new(self.name.clone(), session_id);
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.remove(&addr) {
            debug!(agent = %addr, "deleting session agent");
            if let Err(err) = agent.stop().await {
                warn!(agent = %addr, %err, "failed to stop agent");
            }
        }
    }

    /// One sweep of the recycle loop.
    async fn recycle_once(&self) {
        let mut idle: Vec<Address> = Vec::new();
        let total;
        {
            let agents = self.agents.lock().await;
            total = agents.len();
            for (addr, agent) in agents.iter() {
                if agent.state().await == AgentState::Idle {
                    idle.push(addr.clone());
                }
            }
        }
        if idle.is_empty() {
            return;
        }

        debug!(
            factory = %self.name,
            running = total - idle.len(),
            idle = idle.len(),
            "recycling idle agents"
        );

        let mut stopped: Vec<Arc<dyn Agent>> = Vec::new();
        {
            let mut agents = self.agents.lock().await;
            for addr in idle {
                if let Some(agent) = agents.remove(&addr) {
                    stopped.push(agent);
                }
            }
        }
        // Stopping happens outside the lock; create/delete stay responsive.
        for agent in stopped {
            if let Err(err) = agent.stop().await {
                warn!(factory = %self.name, %err, "failed to stop idle agent");
            }
        }
    }

    async fn ack(&self, reply: Option<&Address>) {
        let Some(reply) = reply else { return };
        let out = match (Empty {}).encode() {
            Ok(out) => out,
            Err(_) => return,
        };
        if let Err(err) = self
            .channel
            .publish(reply.clone(), out, PublishOptions::default())
            .await
        {
            error!(factory = %self.name, %err, "failed to acknowledge");
        }
    }

    async fn reply_error(&self, reply: Option<&Address>, err: &Error) {
        error!(factory = %self.name, %err, "factory operation failed");
        let Some(reply) = reply else { return };
        if let Err(publish_err) = self
            .channel
            .publish(reply.clone(), err.to_raw(), PublishOptions::default())
            .await
        {
            error!(factory = %self.name, %publish_err, "failed to publish error reply");
        }
    }
}

#[async_trait]
impl Agent for Factory {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn state(&self) -> AgentState {
        // Factories live for the whole runtime; they are never recycled.
        AgentState::Running
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let factory = Arc::clone(&self);
        let handler: RawHandler = Arc::new(move |raw| {
            let factory = Arc::clone(&factory);
            Box::pin(async move { factory.receive(raw).await })
        });
        // The queue group load-balances creation requests across replicas
        // of this factory on the same broker.
        let queue = format!("{}_workers", self.address.topic());
        let sub = self
            .channel
            .subscribe(self.address.clone(), handler, &queue)
            .await?;
        *self.sub.lock().await = Some(sub);

        let factory = Arc::clone(&self);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(factory.recycle_interval).await;
                factory.recycle_once().await;
            }
        });
        *self.recycle_task.lock().unwrap() = Some(task.abort_handle());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(sub) = self.sub.lock().await.take() {
            sub.unsubscribe().await?;
        }

        let drained: Vec<Arc<dyn Agent>> = {
            let mut agents = self.agents.lock().await;
            agents.drain().map(|(_, agent)| agent).collect()
        };
        for agent in drained {
            if let Err(err) = agent.stop().await {
                warn!(factory = %self.name, %err, "failed to stop agent");
            }
        }

        if let Some(task) = self.recycle_task.lock().unwrap().take() {
            task.abort();
        }
        Ok(())
    }

    async fn receive(self: Arc<Self>, raw: RawMessage) {
        match raw.header.r#type.as_str() {
            CreateAgent::NAME => {
                let reply = raw.reply.clone();
                let result = match CreateAgent::decode(&raw) {
                    Ok(msg) => self.create_agent(&msg.session_id).await,
                    Err(err) => Err(err),
                };
                match result {
                    // The Empty ack is what unblocks a probing publisher.
                    Ok(()) => self.ack(reply.as_ref()).await,
                    Err(err) => self.reply_error(reply.as_ref(), &err).await,
                }
            }
            DeleteAgent::NAME => match DeleteAgent::decode(&raw) {
                Ok(msg) => {
                    self.delete_agent(&msg.session_id).await;
                    self.ack(raw.reply.as_ref()).await;
                }
                Err(err) => self.reply_error(raw.reply.as_ref(), &err).await,
            },
            Started::NAME | Stopped::NAME | ProbeAgent::NAME | Empty::NAME => {}
            other => {
                let err = Error::MessageDecode(format!("message type '{other}' not found"));
                self.reply_error(raw.reply.as_ref(), &err).await;
            }
        }
    }
}
