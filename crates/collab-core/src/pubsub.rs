//! Cluster transport abstraction — a named-channel broadcast
//! bus the cluster bridge (C8) uses to fan updates out across server
//! instances. A single-process deployment uses [`InProcessPubSub`]; a
//! multi-instance one plugs in Redis, NATS, or similar behind this trait.

use crate::error::ClusterError;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Handle for an active subscription. Dropping it does not itself
/// unsubscribe — callers hold the paired receiver and simply stop polling
/// it; [`PubSub::unsubscribe`] is for backends where channel teardown is an
/// explicit remote operation.
pub type Subscription = broadcast::Receiver<Vec<u8>>;

#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ClusterError>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription, ClusterError>;
    async fn unsubscribe(&self, channel: &str);
}

/// In-process pub/sub over `tokio::sync::broadcast`, one channel per topic,
/// created lazily on first publish or subscribe. Suitable for a
/// single-instance deployment or for tests; a real cluster bridge swaps in a
/// network-backed [`PubSub`].
pub struct InProcessPubSub {
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
}

impl InProcessPubSub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InProcessPubSub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PubSub for InProcessPubSub {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        // No subscribers is not an error: a document with no cluster peers
        // attached yet is the common case, not a failure.
        let _ = self.sender_for(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, ClusterError> {
        Ok(self.sender_for(channel).subscribe())
    }

    async fn unsubscribe(&self, channel: &str) {
        if let Some(sender) = self.channels.get(channel) {
            if sender.receiver_count() == 0 {
                drop(sender);
                self.channels.remove(channel);
            }
        }
    }
}

/// Redis-backed [`PubSub`], for a multi-instance deployment where the
/// in-process bus can't reach peers. Publishing reuses a single multiplexed
/// connection; each subscription opens its own dedicated connection (Redis
/// pub/sub connections can't issue other commands) and forwards messages
/// into a broadcast channel so multiple local callers can share one
/// subscription's receiver type.
#[cfg(feature = "redis-pubsub")]
pub struct RedisPubSub {
    client: redis::Client,
    publish_conn: tokio::sync::Mutex<redis::aio::MultiplexedConnection>,
    capacity: usize,
    tasks: DashMap<String, tokio::task::JoinHandle<()>>,
}

#[cfg(feature = "redis-pubsub")]
impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self, ClusterError> {
        let client = redis::Client::open(url).map_err(|e| ClusterError::SubscribeFailed(e.to_string()))?;
        let publish_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ClusterError::SubscribeFailed(e.to_string()))?;
        Ok(Self {
            client,
            publish_conn: tokio::sync::Mutex::new(publish_conn),
            capacity: 256,
            tasks: DashMap::new(),
        })
    }
}

#[cfg(feature = "redis-pubsub")]
#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), ClusterError> {
        use redis::AsyncCommands;
        self.publish_conn
            .lock()
            .await
            .publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| ClusterError::PublishFailed(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, ClusterError> {
        use futures_util::StreamExt;

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ClusterError::SubscribeFailed(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| ClusterError::SubscribeFailed(e.to_string()))?;

        let (tx, rx) = broadcast::channel(self.capacity);
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });
        self.tasks.insert(channel.to_string(), task);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) {
        if let Some((_, task)) = self.tasks.remove(channel) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InProcessPubSub::default();
        let mut sub = bus.subscribe("doc:room-1").await.unwrap();
        bus.publish("doc:room-1", vec![1, 2, 3]).await.unwrap();
        let received = sub.recv().await.unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = InProcessPubSub::default();
        bus.publish("doc:empty", vec![1]).await.unwrap();
    }
}
