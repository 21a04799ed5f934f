//! Store change events.
//!
//! Every durable mutation publishes an event after its transaction commits,
//! so a frontend can mirror the replica without polling. Delivery is
//! broadcast with a bounded buffer: a subscriber that falls behind loses the
//! oldest events (`RecvError::Lagged`) and should re-read the tables it
//! cares about.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Conversation, Message};
use crate::status::DeliveryStatus;

/// A change applied to the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum StoreEvent {
    /// A conversation was created or its record fields changed.
    ConversationUpserted { conversation: Conversation },
    /// A message was inserted or its server-assigned fields were adopted.
    MessageUpserted { message: Message },
    /// A delivery status advanced through the monotonic guard.
    MessageStatusChanged {
        message_id: String,
        conversation_id: String,
        status: DeliveryStatus,
    },
    /// A message exhausted its send attempts and awaits a user retry.
    MessageSyncFailed {
        message_id: String,
        conversation_id: String,
        error: String,
    },
    /// A conversation's unread counter changed.
    UnreadChanged {
        conversation_id: String,
        unread_count: u32,
    },
}

pub type EventReceiver = broadcast::Receiver<StoreEvent>;

/// Broadcast fan-out for [`StoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. An event with no subscribers is
    /// simply dropped.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }
}
