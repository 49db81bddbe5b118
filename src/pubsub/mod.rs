//! # Pub/Sub Transport
//!
//! Fire-and-forget channel messaging used by distributed runs: chunk workers
//! publish `chunk:done` / `chunk:error` envelopes on `{runId}:events`, and the
//! run's owner consumes them from a [`Subscription`].
//!
//! Delivery is at-least-once from the publisher's point of view; consumers
//! must tolerate duplicates. Messages published before a subscription exists
//! are not replayed.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryPubSub;
#[cfg(feature = "postgres")]
pub use postgres::PgNotifyPubSub;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PubSubError {
    #[error("Publish to {channel} failed: {message}")]
    Publish { channel: String, message: String },

    #[error("Subscribe to {channel} failed: {message}")]
    Subscribe { channel: String, message: String },

    #[error("Message serialization failed: {0}")]
    Serialization(String),
}

impl PubSubError {
    pub fn publish(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn subscribe(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// Receiving end of one channel subscription.
///
/// `recv` returns `None` once the channel has been unsubscribed or the
/// transport gave up on it.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<Value>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: mpsc::Receiver<Value>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    async fn publish(&self, channel: &str, message: &Value) -> Result<(), PubSubError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, PubSubError>;

    /// Drop every subscription of `channel`. Unknown channels are a no-op.
    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError>;

    fn provider_name(&self) -> &'static str;
}
