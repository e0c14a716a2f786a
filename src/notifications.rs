use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("subscription to channel '{channel}' failed: {reason}")]
    Subscribe { channel: String, reason: String },
}

/// One live channel subscription. The reconciler holds this and releases it
/// explicitly via `NotificationBus::unsubscribe`; dropping the receiver has
/// the same effect (the bus prunes dead senders on publish).
pub struct BusSubscription {
    pub id: u64,
    pub channel: String,
    pub events: mpsc::UnboundedReceiver<Value>,
}

/// Push-notification subscription primitive. Delivery is at-least-once:
/// consumers must tolerate duplicates.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;
    fn unsubscribe(&self, channel: &str, subscription_id: u64);
}

struct ChannelSubscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

/// In-process notification bus. Backs tests and demos; production wires a
/// websocket-fed implementation of the same trait.
#[derive(Clone, Default)]
pub struct InProcessBus {
    channels: Arc<Mutex<HashMap<String, Vec<ChannelSubscriber>>>>,
    next_id: Arc<AtomicU64>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live subscriber of `channel`.
    /// Subscribers whose receiver was dropped are pruned here.
    pub fn publish(&self, channel: &str, event: Value) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|subscriber| subscriber.tx.send(event.clone()).is_ok());
        }
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl NotificationBus for InProcessBus {
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(ChannelSubscriber { id, tx });

        debug!(channel, id, "channel subscription opened");
        Ok(BusSubscription {
            id,
            channel: channel.to_string(),
            events: rx,
        })
    }

    fn unsubscribe(&self, channel: &str, subscription_id: u64) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|subscriber| subscriber.id != subscription_id);
        }
        debug!(channel, subscription_id, "channel subscription released");
    }
}
