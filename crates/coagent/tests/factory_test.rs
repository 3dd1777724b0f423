//! Factory behavior: queue-group load balancing, idempotent creation, and
//! the `SetReplyAgent` reply override.

use std::sync::Arc;
use std::time::Duration;

use coagent::{
    Address, Agent, AgentSpec, BaseAgent, Channel, Constructor, CreateAgent, Factory, Handlers,
    LocalChannel, Message, Operations, PublishOptions, RawHandler, RawMessage, Runtime,
    SetReplyAgent,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
struct Ping {}

impl Message for Ping {
    const NAME: &'static str = "Ping";
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
struct Pong {}

impl Message for Pong {
    const NAME: &'static str = "Pong";
}

struct NoOp;

impl Handlers for NoOp {
    fn operations(_ops: &mut Operations<Self>) {}
}

struct PingServer;

impl Handlers for PingServer {
    fn operations(ops: &mut Operations<Self>) {
        ops.on::<Ping, Pong, _, _>("ping", "Answer a ping.", |_state, _msg: Ping, _ctx| {
            async move { Ok(Pong {}) }
        });
    }
}

fn noop_constructor() -> Constructor {
    Arc::new(|channel, address| {
        let agent: Arc<dyn Agent> = BaseAgent::new(NoOp, channel, address);
        Ok(agent)
    })
}

#[tokio::test]
async fn replicated_factories_share_the_load() {
    let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new());

    let first = Arc::new(Factory::new("worker", noop_constructor(), channel.clone()));
    let second = Arc::new(Factory::new("worker", noop_constructor(), channel.clone()));
    Arc::clone(&first).start().await.unwrap();
    Arc::clone(&second).start().await.unwrap();

    for i in 0..100 {
        channel
            .publish(
                Address::factory("worker"),
                CreateAgent {
                    session_id: format!("s{i}"),
                }
                .encode()
                .unwrap(),
                PublishOptions::request().probe(false),
            )
            .await
            .unwrap();
    }

    // Exactly one replica handled each request; 100 distinct sessions give
    // 100 instances across the pair.
    assert_eq!(first.agent_count().await + second.agent_count().await, 100);
    assert!(first.agent_count().await > 0);
    assert!(second.agent_count().await > 0);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn create_is_idempotent_per_replica() {
    let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new());
    let factory = Arc::new(Factory::new("worker", noop_constructor(), channel.clone()));
    Arc::clone(&factory).start().await.unwrap();

    for _ in 0..5 {
        channel
            .publish(
                Address::factory("worker"),
                CreateAgent {
                    session_id: "same".to_string(),
                }
                .encode()
                .unwrap(),
                PublishOptions::request().probe(false),
            )
            .await
            .unwrap();
    }
    assert_eq!(factory.agent_count().await, 1);

    factory.stop().await.unwrap();
}

#[tokio::test]
async fn delete_agent_stops_the_session() {
    let channel: Arc<dyn Channel> = Arc::new(LocalChannel::new());
    let factory = Arc::new(Factory::new("worker", noop_constructor(), channel.clone()));
    Arc::clone(&factory).start().await.unwrap();

    channel
        .publish(
            Address::factory("worker"),
            CreateAgent {
                session_id: "s1".to_string(),
            }
            .encode()
            .unwrap(),
            PublishOptions::request().probe(false),
        )
        .await
        .unwrap();
    assert_eq!(factory.agent_count().await, 1);

    channel
        .publish(
            Address::factory("worker"),
            coagent::DeleteAgent {
                session_id: "s1".to_string(),
            }
            .encode()
            .unwrap(),
            PublishOptions::request().probe(false),
        )
        .await
        .unwrap();
    assert_eq!(factory.agent_count().await, 0);

    factory.stop().await.unwrap();
}

#[tokio::test]
async fn set_reply_agent_overrides_the_message_reply() {
    let runtime = Runtime::local();
    runtime.start().await.unwrap();
    runtime
        .register(AgentSpec::new("server", "A ping server.", || PingServer))
        .await
        .unwrap();

    let addr = Address::new("server", "s1");
    let channel = runtime.channel();

    // A downstream collector tap.
    let downstream = Address::reply("_INBOX.downstream");
    let (tx, mut rx) = mpsc::unbounded_channel::<RawMessage>();
    let handler: RawHandler = Arc::new(move |raw| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(raw);
        })
    });
    channel
        .subscribe(downstream.clone(), handler, "")
        .await
        .unwrap();

    // Install the default reply address, then ask with a normal request.
    channel
        .publish(
            addr.clone(),
            SetReplyAgent {
                address: downstream.clone(),
            }
            .encode()
            .unwrap(),
            PublishOptions::default(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = channel
        .publish(
            addr,
            (Ping {}).encode().unwrap(),
            PublishOptions::request().timeout(Duration::from_millis(100)),
        )
        .await;
    // The reply was rerouted away from the request inbox...
    assert!(err.is_err());
    // ...and into the downstream tap.
    let raw = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(raw.is::<Pong>());

    runtime.stop().await.unwrap();
}
