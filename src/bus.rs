//! In-process message bus (SPEC_FULL.md §4.13), standing in for the
//! out-of-scope external message bus (spec.md §6). One
//! `tokio::sync::broadcast::Sender` per topic family, mirroring the topic
//! list in spec.md §6 rather than one channel shared by every event kind —
//! a subscriber only interested in connection status shouldn't have to
//! filter rollover/upload-job noise out of its own receiver.
//!
//! Grounded on the teacher's `signal_tx: broadcast::Sender<Signal>` /
//! `websocket_broadcaster(signal_tx.subscribe())` pattern in `main.rs`: a
//! `tokio::sync::broadcast` channel per concern, consumers filter by
//! variant within their own family.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Everything that can cross the bus (spec.md §6 topic list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    /// `inventory updates` topic.
    ProductCreated { product_id: i64 },
    BrokerProductCreatedOrUpdated { product_id: i64 },
    /// `system` topic.
    SystemRestart,
    ConnectionChanged {
        system_code: String,
        username: String,
        connection_code: String,
        connected: bool,
    },
    /// `upload-job` topic.
    UploadJobCreate { path: String },
    /// `rollover-recalc` topic.
    RecalcRollover {
        data_product_id: Option<i64>,
        data_block_id: Option<i64>,
    },
    /// `user events` topic: `dc.dataProduct.ready|readyEmpty|readyNoMatch`.
    DataProductReady { product_id: i64 },
    DataProductReadyEmpty { product_id: i64 },
    DataProductReadyNoMatch { product_id: i64 },
}

impl BusEvent {
    fn topic(&self) -> Topic {
        match self {
            BusEvent::ProductCreated { .. } | BusEvent::BrokerProductCreatedOrUpdated { .. } => Topic::Inventory,
            BusEvent::SystemRestart | BusEvent::ConnectionChanged { .. } => Topic::System,
            BusEvent::UploadJobCreate { .. } => Topic::UploadJob,
            BusEvent::RecalcRollover { .. } => Topic::RolloverRecalc,
            BusEvent::DataProductReady { .. } | BusEvent::DataProductReadyEmpty { .. } | BusEvent::DataProductReadyNoMatch { .. } => {
                Topic::UserEvent
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Topic {
    Inventory,
    System,
    UploadJob,
    RolloverRecalc,
    UserEvent,
}

const CHANNEL_CAPACITY: usize = 1024;

/// Shared publish/subscribe bus: one broadcast channel per topic family.
/// Cloning is cheap (clones five senders).
#[derive(Clone)]
pub struct BroadcastMessageBus {
    inventory: broadcast::Sender<BusEvent>,
    system: broadcast::Sender<BusEvent>,
    upload_job: broadcast::Sender<BusEvent>,
    rollover_recalc: broadcast::Sender<BusEvent>,
    user_event: broadcast::Sender<BusEvent>,
}

impl Default for BroadcastMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastMessageBus {
    pub fn new() -> Self {
        let (inventory, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (system, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (upload_job, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (rollover_recalc, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (user_event, _) = broadcast::channel(CHANNEL_CAPACITY);
        BroadcastMessageBus {
            inventory,
            system,
            upload_job,
            rollover_recalc,
            user_event,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<BusEvent> {
        match topic {
            Topic::Inventory => &self.inventory,
            Topic::System => &self.system,
            Topic::UploadJob => &self.upload_job,
            Topic::RolloverRecalc => &self.rollover_recalc,
            Topic::UserEvent => &self.user_event,
        }
    }

    pub fn publish(&self, event: BusEvent) {
        // No subscribers is not an error (matches broadcast::send's semantics for
        // fire-and-forget notifications the teacher's scrapers rely on).
        let sender = self.sender(event.topic());
        if sender.send(event).is_err() {
            warn!("message bus: publish with no active subscribers");
        }
    }

    pub fn subscribe_inventory(&self) -> broadcast::Receiver<BusEvent> {
        self.inventory.subscribe()
    }

    pub fn subscribe_system(&self) -> broadcast::Receiver<BusEvent> {
        self.system.subscribe()
    }

    pub fn subscribe_upload_job(&self) -> broadcast::Receiver<BusEvent> {
        self.upload_job.subscribe()
    }

    pub fn subscribe_rollover_recalc(&self) -> broadcast::Receiver<BusEvent> {
        self.rollover_recalc.subscribe()
    }

    pub fn subscribe_user_event(&self) -> broadcast::Receiver<BusEvent> {
        self.user_event.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_route_to_their_own_topic_family() {
        let bus = BroadcastMessageBus::new();
        let mut system_rx = bus.subscribe_system();
        let mut rollover_rx = bus.subscribe_rollover_recalc();

        bus.publish(BusEvent::SystemRestart);
        bus.publish(BusEvent::RecalcRollover {
            data_product_id: Some(1),
            data_block_id: None,
        });

        assert!(matches!(system_rx.recv().await.unwrap(), BusEvent::SystemRestart));
        assert!(matches!(rollover_rx.recv().await.unwrap(), BusEvent::RecalcRollover { .. }));
        // a system-topic subscriber never sees a rollover-recalc event
        assert!(system_rx.try_recv().is_err());
    }
}
