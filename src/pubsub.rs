//! Redis pub/sub transport for invalidation messages
//!
//! Publishing goes through a `ConnectionManager` that may be shared with the
//! Redis store. Each subscription owns a dedicated pub/sub connection, because
//! a subscribed connection cannot issue ordinary commands. A dropped
//! subscription connection is re-established with exponential backoff, and
//! the subscriber is told about the gap.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSub};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::CacheError;
use crate::invalidation::{BusEvent, BusMessage, InvalidationBus, Subscription};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Open a publisher connection of its own.
    pub async fn connect(client: redis::Client) -> Result<Self, CacheError> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }

    /// Publish over an existing connection, e.g. the one the store uses.
    pub fn with_publisher(client: redis::Client, publisher: ConnectionManager) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl InvalidationBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, &payload).await?;
        debug!(channel, "RedisBus: published invalidation");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, CacheError> {
        let pubsub = open_subscription(&self.client, pattern).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_subscription(
            self.client.clone(),
            pattern.to_owned(),
            pubsub,
            tx,
        ));

        Ok(rx)
    }
}

async fn open_subscription(client: &redis::Client, pattern: &str) -> Result<PubSub, CacheError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    debug!(pattern, "RedisBus: subscribed");
    Ok(pubsub)
}

async fn run_subscription(
    client: redis::Client,
    pattern: String,
    mut pubsub: PubSub,
    tx: mpsc::UnboundedSender<BusEvent>,
) {
    loop {
        {
            let mut messages = std::pin::pin!(pubsub.on_message());
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!(pattern = %pattern, "RedisBus: subscriber dropped, closing");
                        return;
                    }
                    next = messages.next() => match next {
                        Some(msg) => match msg.get_payload::<String>() {
                            Ok(payload) => {
                                let channel = msg.get_channel_name().to_owned();
                                let msg = BusMessage { channel, payload };
                                if tx.send(BusEvent::Message(msg)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(pattern = %pattern, error = %e, "RedisBus: failed to decode pub/sub payload");
                            }
                        },
                        None => break,
                    },
                }
            }
        }

        warn!(pattern = %pattern, "RedisBus: pub/sub connection lost; reconnecting");
        match reconnect(&client, &pattern, &tx).await {
            Some(fresh) => pubsub = fresh,
            None => return,
        }
        // anything published while disconnected is gone
        if tx.send(BusEvent::Gap).is_err() {
            return;
        }
    }
}

async fn reconnect(
    client: &redis::Client,
    pattern: &str,
    tx: &mpsc::UnboundedSender<BusEvent>,
) -> Option<PubSub> {
    let mut attempt = 0u32;
    let mut delay_ms = INITIAL_BACKOFF_MS;

    while !tx.is_closed() {
        attempt += 1;
        match open_subscription(client, pattern).await {
            Ok(pubsub) => return Some(pubsub),
            Err(e) => {
                warn!(pattern, attempt, error = %e, "RedisBus: resubscribe failed");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = delay_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
        }
    }
    None
}
