//! Addressable delivery fabric for pushing commands to live controller
//! connections. A channel id names whichever process currently holds the
//! controller's socket; publishing is fire-and-forget, so a message sent to a
//! channel whose connection has since dropped is silently discarded.

use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()>;
}

type TopicMap = parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>;

/// Simple in-memory bus for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: TopicMap,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(channel).subscribe()
    }

    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(channel);
        // No live receiver means the connection dropped; the message is lost
        // by contract, not an error.
        let _ = sender.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Redis PUBLISH/SUBSCRIBE bus for multi-process deployments. Each subscribed
/// channel gets one bridging task that fans Redis messages into a broadcast
/// sender, so the consuming side looks identical to [`LocalBus`].
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    channels: TopicMap,
}

impl RedisBus {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client =
            redis::Client::open(url).map_err(|err| BusError::Transport(err.to_string()))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            publisher,
            channels: TopicMap::default(),
        })
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.channels.write();
        if let Some(sender) = guard.get(channel) {
            return sender.clone();
        }
        let (sender, _) = broadcast::channel(64);
        guard.insert(channel.to_string(), sender.clone());

        let client = self.client.clone();
        let channel = channel.to_string();
        let bridge = sender.clone();
        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    tracing::warn!(%channel, error = %err, "failed to open redis pubsub");
                    return;
                }
            };
            if let Err(err) = pubsub.subscribe(&channel).await {
                tracing::warn!(%channel, error = %err, "failed to subscribe to redis channel");
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: Vec<u8> = message.get_payload().unwrap_or_default();
                let _ = bridge.send(BusMessage {
                    channel: channel.clone(),
                    payload: Bytes::from(payload),
                });
            }
        });

        sender
    }
}

impl Bus for RedisBus {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(channel).subscribe()
    }

    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publisher.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let result: Result<(), redis::RedisError> =
                redis::AsyncCommands::publish(&mut conn, &channel, payload.to_vec()).await;
            if let Err(err) = result {
                tracing::warn!(%channel, error = %err, "redis publish failed");
            }
        });
        Ok(())
    }
}
