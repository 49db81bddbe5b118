//! In-process [`PubSub`] backed by bounded `mpsc` channels.
//!
//! ```rust
//! use jobflow::pubsub::{InMemoryPubSub, PubSub};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let pubsub = InMemoryPubSub::new(16);
//! let mut subscription = pubsub.subscribe("run-1:events").await?;
//!
//! pubsub.publish("run-1:events", &json!({"type": "chunk:done", "chunkIndex": 0})).await?;
//! assert_eq!(subscription.recv().await.unwrap()["chunkIndex"], 0);
//! # Ok::<(), jobflow::pubsub::PubSubError>(())
//! # }).unwrap();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{PubSub, PubSubError, Subscription};
use crate::constants::defaults;

#[derive(Debug)]
pub struct InMemoryPubSub {
    channels: DashMap<String, Vec<mpsc::Sender<Value>>>,
    buffer_size: usize,
    published: AtomicU64,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new(defaults::PUBSUB_BUFFER)
    }
}

impl InMemoryPubSub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer_size: buffer_size.max(1),
            published: AtomicU64::new(0),
        }
    }

    /// Live subscribers of `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Channels with at least one subscription, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    /// Messages accepted by `publish`, delivered or not.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &str, message: &Value) -> Result<(), PubSubError> {
        self.published.fetch_add(1, Ordering::SeqCst);

        // Clone the senders so no map guard is held across an await.
        let senders = match self.channels.get(channel) {
            Some(senders) => senders.clone(),
            None => {
                trace!(channel = %channel, "Publish without subscribers");
                return Ok(());
            }
        };

        for sender in senders {
            // A closed receiver is a subscriber that went away.
            let _ = sender.send(message.clone()).await;
        }

        if let Some(mut entry) = self.channels.get_mut(channel) {
            entry.retain(|s| !s.is_closed());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, PubSubError> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.channels.entry(channel.to_string()).or_default().push(tx);
        debug!(channel = %channel, "Subscribed");
        Ok(Subscription::new(channel, rx))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        if self.channels.remove(channel).is_some() {
            debug!(channel = %channel, "Unsubscribed");
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
