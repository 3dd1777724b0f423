//! In-process broker.
//!
//! Exact-topic subscriptions over plain channels, suitable for single
//! process deployments and tests. Each subscription owns a FIFO worker task
//! so it observes messages in delivery order; queue groups load-balance
//! round-robin among members sharing the group name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Channel, DynSubscription, RawHandler, Subscription};
use crate::address::Address;
use crate::error::Result;
use crate::message::RawMessage;

#[derive(Default)]
struct TopicSubs {
    entries: Vec<SubEntry>,
    /// Round-robin cursor per queue group.
    cursors: HashMap<String, usize>,
}

struct SubEntry {
    id: u64,
    queue: String,
    tx: mpsc::UnboundedSender<RawMessage>,
}

#[derive(Default)]
struct Broker {
    topics: Mutex<HashMap<String, TopicSubs>>,
    next_id: AtomicU64,
}

impl Broker {
    fn deliver(&self, topic: &str, raw: RawMessage) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = topics.get_mut(topic) else {
            debug!(topic, r#type = %raw.header.r#type, "no subscribers");
            return;
        };

        // Plain subscribers each get a copy.
        for entry in subs.entries.iter().filter(|e| e.queue.is_empty()) {
            let _ = entry.tx.send(raw.clone());
        }

        // Queue groups get exactly one copy, round-robin within the group.
        let groups: Vec<String> = subs
            .entries
            .iter()
            .filter(|e| !e.queue.is_empty())
            .map(|e| e.queue.clone())
            .collect();
        for queue in dedup(groups) {
            let members: Vec<usize> = subs
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.queue == queue)
                .map(|(i, _)| i)
                .collect();
            let cursor = subs.cursors.entry(queue).or_insert(0);
            let pick = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let _ = subs.entries[pick].tx.send(raw.clone());
        }
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(topic) {
            subs.entries.retain(|e| e.id != id);
            if subs.entries.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

fn dedup(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

/// A trivial in-process [`Channel`].
///
/// Clones share the same broker, so several runtimes constructed from
/// clones of one `LocalChannel` behave like a cluster of processes on one
/// broker.
#[derive(Clone, Default)]
pub struct LocalChannel {
    broker: Arc<Broker>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut topics = self.broker.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.clear();
        Ok(())
    }

    async fn send(&self, topic: &str, raw: RawMessage) -> Result<()> {
        self.broker.deliver(topic, raw);
        Ok(())
    }

    async fn subscribe(
        &self,
        addr: Address,
        handler: RawHandler,
        queue: &str,
    ) -> Result<DynSubscription> {
        let topic = addr.topic();
        let id = self.broker.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<RawMessage>();

        // FIFO worker: the subscription sees messages in delivery order.
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                handler(raw).await;
            }
        });

        {
            let mut topics = self.broker.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics.entry(topic.clone()).or_default().entries.push(SubEntry {
                id,
                queue: queue.to_string(),
                tx,
            });
        }

        Ok(Arc::new(LocalSubscription {
            broker: self.broker.clone(),
            topic,
            id,
        }))
    }

    async fn new_reply_topic(&self) -> Result<String> {
        Ok(format!("_INBOX.{}", nanoid::nanoid!()))
    }
}

struct LocalSubscription {
    broker: Arc<Broker>,
    topic: String,
    id: u64,
}

#[async_trait]
impl Subscription for LocalSubscription {
    async fn unsubscribe(&self) -> Result<()> {
        self.broker.remove(&self.topic, self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::channel::PublishOptions;
    use crate::error::Error;
    use crate::message::{ErrorMessage, Message, StopIteration};

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
    struct Note {
        text: String,
    }

    impl Message for Note {
        const NAME: &'static str = "Note";
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

    #[tokio::test]
    async fn delivers_to_all_plain_subscribers() {
        let channel = LocalChannel::new();
        let addr = Address::factory("notes");
        let (h1, mut rx1) = collector();
        let (h2, mut rx2) = collector();
        channel.subscribe(addr.clone(), h1, "").await.unwrap();
        channel.subscribe(addr.clone(), h2, "").await.unwrap();

        let msg = Note { text: "hi".into() }.encode().unwrap();
        channel
            .publish(addr, msg, PublishOptions::default().probe(false))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().header.r#type, "Note");
        assert_eq!(rx2.recv().await.unwrap().header.r#type, "Note");
    }

    #[tokio::test]
    async fn queue_group_delivers_to_exactly_one_member() {
        let channel = LocalChannel::new();
        let addr = Address::factory("workers");
        let (h1, mut rx1) = collector();
        let (h2, mut rx2) = collector();
        channel.subscribe(addr.clone(), h1, "grp").await.unwrap();
        channel.subscribe(addr.clone(), h2, "grp").await.unwrap();

        for i in 0..10 {
            let msg = Note {
                text: format!("{i}"),
            }
            .encode()
            .unwrap();
            channel
                .publish(addr.clone(), msg, PublishOptions::default().probe(false))
                .await
                .unwrap();
        }
        // Let the subscription workers drain their queues.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = 0;
        while let Ok(raw) = rx1.try_recv() {
            let _ = raw;
            seen += 1;
        }
        let mut seen2 = 0;
        while let Ok(raw) = rx2.try_recv() {
            let _ = raw;
            seen2 += 1;
        }
        assert_eq!(seen + seen2, 10);
        // Round-robin splits evenly.
        assert_eq!(seen, 5);
        assert_eq!(seen2, 5);
    }

    #[tokio::test]
    async fn request_reply() {
        let channel = LocalChannel::new();
        let addr = Address::factory("echo");

        let responder = channel.clone();
        let handler: RawHandler = Arc::new(move |raw| {
            let responder = responder.clone();
            Box::pin(async move {
                if let Some(ref reply) = raw.reply {
                    let reply = reply.clone();
                    let note = Note::decode(&raw).unwrap();
                    let out = Note {
                        text: format!("echo: {}", note.text),
                    }
                    .encode()
                    .unwrap();
                    let _ = responder
                        .publish(reply, out, PublishOptions::default())
                        .await;
                }
            })
        });
        channel.subscribe(addr.clone(), handler, "").await.unwrap();

        let reply = channel
            .publish(
                addr,
                Note { text: "hi".into() }.encode().unwrap(),
                PublishOptions::request().probe(false),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Note::decode(&reply).unwrap().text, "echo: hi");
    }

    #[tokio::test]
    async fn request_times_out_without_subscriber() {
        let channel = LocalChannel::new();
        let err = channel
            .publish(
                Address::factory("nobody"),
                Note::default().encode().unwrap(),
                PublishOptions::request()
                    .timeout(Duration::from_millis(20))
                    .probe(false),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeliverTimeout(_)));
    }

    #[tokio::test]
    async fn publish_multi_terminates_on_stop_iteration() {
        let channel = LocalChannel::new();
        let addr = Address::factory("stream");

        let responder = channel.clone();
        let handler: RawHandler = Arc::new(move |raw| {
            let responder = responder.clone();
            Box::pin(async move {
                let reply = raw.reply.unwrap();
                for i in 0..3 {
                    let out = Note {
                        text: format!("{i}"),
                    }
                    .encode()
                    .unwrap();
                    let _ = responder
                        .publish(reply.clone(), out, PublishOptions::default())
                        .await;
                }
                let _ = responder
                    .publish(
                        reply,
                        StopIteration {}.encode().unwrap(),
                        PublishOptions::default(),
                    )
                    .await;
            })
        });
        channel.subscribe(addr.clone(), handler, "").await.unwrap();

        let mut stream = channel
            .publish_multi(addr, Note::default().encode().unwrap(), false)
            .await
            .unwrap();

        let mut texts = Vec::new();
        while let Some(item) = stream.next().await {
            texts.push(Note::decode(&item.unwrap()).unwrap().text);
        }
        assert_eq!(texts, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn publish_multi_raises_remote_error() {
        let channel = LocalChannel::new();
        let addr = Address::factory("failing");

        let responder = channel.clone();
        let handler: RawHandler = Arc::new(move |raw| {
            let responder = responder.clone();
            Box::pin(async move {
                let reply = raw.reply.unwrap();
                let err = ErrorMessage {
                    code: "internal".into(),
                    message: "boom".into(),
                }
                .encode()
                .unwrap();
                let _ = responder
                    .publish(reply, err, PublishOptions::default())
                    .await;
            })
        });
        channel.subscribe(addr.clone(), handler, "").await.unwrap();

        let mut stream = channel
            .publish_multi(addr, Note::default().encode().unwrap(), false)
            .await
            .unwrap();

        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(Error::Internal(_))));
        assert!(stream.next().await.is_none());
    }
}
