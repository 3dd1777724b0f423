//! Discovery scenarios: hierarchical queries, change notifications, and
//! subscription synchronization across runtimes sharing one broker.

use std::sync::Arc;
use std::time::Duration;

use coagent::{
    Address, AgentSpec, AgentsDeregistered, AgentsRegistered, Channel, DiscoveryQuery,
    DiscoveryReply, Handlers, LocalChannel, Message, Operations, PublishOptions, RawHandler,
    RawMessage, Runtime, RuntimeConfig, SubscribeToAgentUpdates,
};
use tokio::sync::mpsc;

struct NoOp;

impl Handlers for NoOp {
    fn operations(_ops: &mut Operations<Self>) {}
}

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        discovery_gather_window: Duration::from_millis(100),
        discovery_sync_window: Duration::from_millis(20),
        ..Default::default()
    }
}

async fn register_all(runtime: &Runtime, names: &[&str]) {
    for name in names {
        runtime
            .register(AgentSpec::new(*name, "", || NoOp))
            .await
            .unwrap();
    }
}

async fn query(runtime: &Runtime, query: DiscoveryQuery) -> Vec<String> {
    let raw = runtime
        .channel()
        .publish(
            Address::factory("discovery"),
            query.encode().unwrap(),
            PublishOptions::request()
                .timeout(Duration::from_millis(400))
                .probe(false),
        )
        .await
        .unwrap()
        .unwrap();
    let reply = DiscoveryReply::decode(&raw).unwrap();
    reply.agents.into_iter().map(|agent| agent.name).collect()
}

fn collector() -> (RawHandler, mpsc::UnboundedReceiver<RawMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: RawHandler = Arc::new(move |raw| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(raw);
        })
    });
    (handler, rx)
}

/// Wait for the next envelope of type `M`, skipping lifecycle noise.
async fn next_of<M: Message>(
    inbox: &mut mpsc::UnboundedReceiver<RawMessage>,
    wait: Duration,
) -> Option<M> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let raw = tokio::time::timeout_at(deadline, inbox.recv()).await.ok()??;
        if raw.is::<M>() {
            return Some(M::decode(&raw).unwrap());
        }
    }
}

#[tokio::test]
async fn hierarchical_query_semantics() {
    let runtime = Runtime::with_config(Arc::new(LocalChannel::new()), fast_config());
    runtime.start().await.unwrap();
    register_all(
        &runtime,
        &["a", "a.x", "a.x.0", "a.y", "a.y.0", "b", "b.x", "b.y", "b.z.0"],
    )
    .await;

    let q = |namespace: &str, recursive: bool, inclusive: bool| DiscoveryQuery {
        namespace: namespace.to_string(),
        recursive,
        inclusive,
        detailed: false,
    };

    assert_eq!(query(&runtime, q("", false, false)).await, ["a", "b"]);
    assert_eq!(
        query(&runtime, q("", true, false)).await,
        ["a", "a.x", "a.x.0", "a.y", "a.y.0", "b", "b.x", "b.y", "b.z.0"]
    );
    assert_eq!(query(&runtime, q("a", false, false)).await, ["a.x", "a.y"]);
    assert_eq!(
        query(&runtime, q("a", true, false)).await,
        ["a.x", "a.x.0", "a.y", "a.y.0"]
    );
    assert_eq!(
        query(&runtime, q("b", false, true)).await,
        ["b", "b.x", "b.y"]
    );
    assert_eq!(
        query(&runtime, q("b", true, true)).await,
        ["b", "b.x", "b.y", "b.z.0"]
    );
    assert_eq!(
        query(&runtime, q("b", true, false)).await,
        ["b.x", "b.y", "b.z.0"]
    );

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn detailed_queries_carry_operations() {
    struct Pinger;

    impl Handlers for Pinger {
        fn operations(ops: &mut Operations<Self>) {
            ops.on::<Ping, Pong, _, _>("ping", "Answer a ping.", |_state, _msg: Ping, _ctx| {
                async move { Ok(Pong {}) }
            });
        }
    }

    #[derive(Debug, Default, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
    struct Ping {}
    impl Message for Ping {
        const NAME: &'static str = "Ping";
    }
    #[derive(Debug, Default, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
    struct Pong {}
    impl Message for Pong {
        const NAME: &'static str = "Pong";
    }

    let runtime = Runtime::with_config(Arc::new(LocalChannel::new()), fast_config());
    runtime.start().await.unwrap();
    runtime
        .register(AgentSpec::new("server", "A ping server.", || Pinger))
        .await
        .unwrap();

    let raw = runtime
        .channel()
        .publish(
            Address::factory("discovery"),
            DiscoveryQuery {
                detailed: true,
                ..Default::default()
            }
            .encode()
            .unwrap(),
            PublishOptions::request()
                .timeout(Duration::from_millis(400))
                .probe(false),
        )
        .await
        .unwrap()
        .unwrap();
    let reply = DiscoveryReply::decode(&raw).unwrap();

    assert_eq!(reply.agents.len(), 1);
    let schema = &reply.agents[0];
    assert_eq!(schema.name, "server");
    assert_eq!(schema.description, "A ping server.");
    assert_eq!(schema.operations.len(), 1);
    assert_eq!(schema.operations[0].name, "ping");
    assert!(schema.operations[0].message.is_object());

    // The plain query omits operations.
    let names = query(&runtime, DiscoveryQuery::default()).await;
    assert_eq!(names, ["server"]);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn change_notifications_follow_the_query() {
    let runtime = Runtime::with_config(Arc::new(LocalChannel::new()), fast_config());
    runtime.start().await.unwrap();
    runtime
        .register(AgentSpec::new("watcher", "", || NoOp))
        .await
        .unwrap();

    // Tap the watcher session's topic; notifications are probed, so the
    // watcher type must exist as a registered agent.
    let watcher = Address::new("watcher", "w1");
    let (handler, mut inbox) = collector();
    runtime
        .channel()
        .subscribe(watcher.clone(), handler, "")
        .await
        .unwrap();

    runtime
        .channel()
        .publish(
            Address::factory("discovery"),
            SubscribeToAgentUpdates {
                sender: watcher.clone(),
                query: DiscoveryQuery {
                    namespace: "alpha".to_string(),
                    recursive: true,
                    ..Default::default()
                },
            }
            .encode()
            .unwrap(),
            PublishOptions::default().probe(false),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Matching registration notifies the watcher.
    runtime
        .register(AgentSpec::new("alpha.x", "", || NoOp))
        .await
        .unwrap();
    let event = next_of::<AgentsRegistered>(&mut inbox, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(event.agents.len(), 1);
    assert_eq!(event.agents[0].name, "alpha.x");

    // Non-matching registration stays silent.
    runtime
        .register(AgentSpec::new("beta", "", || NoOp))
        .await
        .unwrap();
    assert!(
        next_of::<AgentsRegistered>(&mut inbox, Duration::from_millis(100))
            .await
            .is_none()
    );

    // Matching deregistration notifies symmetrically.
    runtime.deregister(&["alpha.x"]).await.unwrap();
    let event = next_of::<AgentsDeregistered>(&mut inbox, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(event.agents[0].name, "alpha.x");

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn new_server_synchronizes_existing_subscriptions() {
    let channel = LocalChannel::new();
    let first = Runtime::with_config(Arc::new(channel.clone()), fast_config());
    first.start().await.unwrap();
    first
        .register(AgentSpec::new("watcher", "", || NoOp))
        .await
        .unwrap();

    let watcher = Address::new("watcher", "w1");
    let (handler, mut inbox) = collector();
    first
        .channel()
        .subscribe(watcher.clone(), handler, "")
        .await
        .unwrap();
    first
        .channel()
        .publish(
            Address::factory("discovery"),
            SubscribeToAgentUpdates {
                sender: watcher.clone(),
                query: DiscoveryQuery {
                    namespace: "alpha".to_string(),
                    recursive: true,
                    ..Default::default()
                },
            }
            .encode()
            .unwrap(),
            PublishOptions::default().probe(false),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A second runtime joins the same broker; its discovery server absorbs
    // the subscription table at startup, so registrations made through it
    // still reach the watcher.
    let second = Runtime::with_config(Arc::new(channel.clone()), fast_config());
    second.start().await.unwrap();
    second
        .register(AgentSpec::new("alpha.y", "", || NoOp))
        .await
        .unwrap();

    let event = next_of::<AgentsRegistered>(&mut inbox, Duration::from_millis(400))
        .await
        .unwrap();
    assert_eq!(event.agents[0].name, "alpha.y");

    second.stop().await.unwrap();
    first.stop().await.unwrap();
}
