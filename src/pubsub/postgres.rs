//! [`PubSub`] over PostgreSQL `LISTEN/NOTIFY` using `sqlx::PgListener`.
//!
//! Each subscription owns one listener connection and a forwarding task that
//! decodes notification payloads as JSON. NOTIFY payloads are limited to
//! 8000 bytes by PostgreSQL, so chunk results should stay small.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{PubSub, PubSubError, Subscription};

pub struct PgNotifyPubSub {
    pool: PgPool,
    buffer_size: usize,
    forwarders: DashMap<String, Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PgNotifyPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifyPubSub")
            .field("buffer_size", &self.buffer_size)
            .field("channels", &self.forwarders.len())
            .finish()
    }
}

impl PgNotifyPubSub {
    pub fn new(pool: PgPool, buffer_size: usize) -> Self {
        Self {
            pool,
            buffer_size: buffer_size.max(1),
            forwarders: DashMap::new(),
        }
    }
}

#[async_trait]
impl PubSub for PgNotifyPubSub {
    #[instrument(skip(self, message), fields(channel = %channel))]
    async fn publish(&self, channel: &str, message: &Value) -> Result<(), PubSubError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| PubSubError::Serialization(e.to_string()))?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| PubSubError::publish(channel, e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(channel = %channel))]
    async fn subscribe(&self, channel: &str) -> Result<Subscription, PubSubError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| PubSubError::subscribe(channel, e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| PubSubError::subscribe(channel, e.to_string()))?;

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let channel_name = channel.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Listener connection lost");
                        break;
                    }
                };
                match serde_json::from_str::<Value>(notification.payload()) {
                    Ok(value) => {
                        if tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            channel = %channel_name,
                            error = %e,
                            "Dropping notification with non-JSON payload"
                        );
                    }
                }
            }
            debug!(channel = %channel_name, "Notification forwarder stopped");
        });

        self.forwarders
            .entry(channel.to_string())
            .or_default()
            .push(handle);
        info!("Listening for notifications");
        Ok(Subscription::new(channel, rx))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), PubSubError> {
        if let Some((_, handles)) = self.forwarders.remove(channel) {
            // Aborting drops the listener, which closes its connection.
            for handle in handles {
                handle.abort();
            }
            debug!(channel = %channel, "Unsubscribed");
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "pg_notify"
    }
}
