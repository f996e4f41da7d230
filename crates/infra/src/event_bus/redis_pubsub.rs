//! Redis pub/sub notifier.
//!
//! Pub/sub is not durable: a subscriber that is offline misses messages.
//! That is acceptable for change notifications because readers re-fetch the
//! stats document, which is the source of truth.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use warlog_events::{EventBus, Notification, Subscription};

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Publishes [`Notification`]s as JSON on one Redis channel.
#[derive(Debug, Clone)]
pub struct RedisPubSubNotifier {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubNotifier {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<Notification> for RedisPubSubNotifier {
    type Error = RedisBusError;

    #[instrument(
        skip(self, message),
        fields(channel = %self.channel, event_type = message.event.event_type()),
        err
    )]
    fn publish(&self, message: Notification) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        debug!(receivers, "notification published");

        Ok(())
    }

    fn subscribe(&self) -> Subscription<Notification> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Forwarding thread; exits when the connection drops or the
        // subscription is dropped.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "redis subscribe: connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(&channel) {
                warn!(error = %e, channel = %channel, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(msg) => msg,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };

                let notification: Notification = match serde_json::from_str(&payload) {
                    Ok(notification) => notification,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable notification");
                        continue;
                    }
                };

                if tx.send(notification).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::DEFAULT_CHANNEL;

    #[test]
    fn rejects_malformed_urls() {
        let err = RedisPubSubNotifier::new("not a url", DEFAULT_CHANNEL).unwrap_err();
        assert!(matches!(err, RedisBusError::Redis(_)));
    }

    #[test]
    fn keeps_configured_channel() {
        let notifier = RedisPubSubNotifier::new("redis://127.0.0.1:6379", "stats").unwrap();
        assert_eq!(notifier.channel(), "stats");
    }
}
