//! Shared engine context.

use std::collections::HashSet;
use std::sync::Arc;

use beacon_remote::RemoteStore;
use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::config::SyncConfig;
use crate::db::DbPool;
use crate::error::SyncError;
use crate::events::EventBus;
use crate::traits::{Identity, Notifier, RecipientPolicy};

/// Everything the engine's services share: the replica, the remote store,
/// the collaborator seams, and the small amount of cross-task signalling.
/// Held behind one `Arc` and cloned into each background task.
pub struct EngineState {
    pub(crate) pool: DbPool,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) events: EventBus,
    pub(crate) identity: Arc<dyn Identity>,
    pub(crate) policy: Arc<dyn RecipientPolicy>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: SyncConfig,
    /// Nudges the outbound worker ahead of its next tick.
    pub(crate) wake: Notify,
    /// Conversations being torn down. The worker skips their queued
    /// mutations so a teardown isn't raced by in-flight retries.
    pub(crate) suppressed: RwLock<HashSet<String>>,
}

impl EngineState {
    /// The signed-in user, or a logged refusal. Every writing operation
    /// starts here.
    pub(crate) fn own_user_id(&self, operation: &'static str) -> Result<String, SyncError> {
        match self.identity.current_user_id() {
            Some(id) => Ok(id),
            None => {
                tracing::warn!(operation, "no signed-in user, ignoring request");
                Err(SyncError::NoIdentity)
            }
        }
    }

    pub(crate) fn wake_outbound(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn is_suppressed(&self, conversation_id: &str) -> bool {
        self.suppressed.read().contains(conversation_id)
    }

    pub(crate) fn suppress(&self, conversation_id: &str) {
        self.suppressed.write().insert(conversation_id.to_string());
    }

    pub(crate) fn unsuppress(&self, conversation_id: &str) {
        self.suppressed.write().remove(conversation_id);
    }
}
