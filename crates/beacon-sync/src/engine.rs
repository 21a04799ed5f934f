//! The engine facade.
//!
//! One [`SyncEngine`] per signed-in profile owns the replica, the outbound
//! worker, and the listener tasks. Methods persist locally first and return
//! as soon as the replica reflects the change; delivery and reconciliation
//! happen in the background and surface through [`SyncEngine::events`].

use std::collections::HashSet;
use std::sync::Arc;

use beacon_remote::{RemoteStore, WireStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::config::SyncConfig;
use crate::db::{timestamp_now, DbPool};
use crate::db_helpers::db_call;
use crate::error::{SyncError, ValidationError};
use crate::events::{EventBus, EventReceiver, StoreEvent};
use crate::model::{Conversation, Message, MutationPayload};
use crate::services::listener::ListenerManager;
use crate::services::outbound::{self, OutboundHandle};
use crate::services::resolver::{self, requeue_create_if_failed};
use crate::state::EngineState;
use crate::status::DeliveryStatus;
use crate::traits::{Identity, Notifier, RecipientPolicy};
use crate::{conversation_repo, message_repo, outbox_repo};

pub struct SyncEngine {
    ctx: Arc<EngineState>,
    listeners: ListenerManager,
    outbound: Mutex<Option<OutboundHandle>>,
}

impl SyncEngine {
    /// Assemble the engine and start its outbound worker. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: SyncConfig,
        pool: DbPool,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn Identity>,
        policy: Arc<dyn RecipientPolicy>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let ctx = Arc::new(EngineState {
            pool,
            remote,
            events,
            identity,
            policy,
            notifier,
            config,
            wake: Notify::new(),
            suppressed: RwLock::new(HashSet::new()),
        });
        let listeners = ListenerManager::new(ctx.clone());
        let outbound = Mutex::new(Some(outbound::start(ctx.clone())));
        Self {
            ctx,
            listeners,
            outbound,
        }
    }

    /// Subscribe to replica change events.
    pub fn events(&self) -> EventReceiver {
        self.ctx.events.subscribe()
    }

    // ── Conversations ───────────────────────────────────────────────────────

    /// Resolve (or optimistically create) the direct conversation with
    /// another user. Both sides resolve to the same record.
    pub async fn create_or_get_conversation(
        &self,
        other_user_id: &str,
    ) -> Result<Conversation, SyncError> {
        resolver::create_or_get(&self.ctx, other_user_id).await
    }

    /// Create a group conversation.
    pub async fn create_group_conversation(
        &self,
        other_user_ids: &[String],
        display_name: Option<String>,
    ) -> Result<Conversation, SyncError> {
        resolver::create_group(&self.ctx, other_user_ids, display_name).await
    }

    /// Conversations for display: pinned first, then most recent.
    pub async fn conversations(
        &self,
        include_archived: bool,
    ) -> Result<Vec<Conversation>, SyncError> {
        db_call(&self.ctx.pool, move |conn| {
            conversation_repo::list(conn, include_archived)
        })
        .await
    }

    pub async fn conversation(&self, id: &str) -> Result<Option<Conversation>, SyncError> {
        let id = id.to_string();
        db_call(&self.ctx.pool, move |conn| conversation_repo::get(conn, &id)).await
    }

    pub async fn set_pinned(&self, conversation_id: &str, pinned: bool) -> Result<(), SyncError> {
        self.ctx.own_user_id("set_pinned")?;
        self.set_presentation(conversation_id, move |conn, id| {
            conversation_repo::set_pinned(conn, id, pinned)
        })
        .await
    }

    pub async fn set_archived(
        &self,
        conversation_id: &str,
        archived: bool,
    ) -> Result<(), SyncError> {
        self.ctx.own_user_id("set_archived")?;
        self.set_presentation(conversation_id, move |conn, id| {
            conversation_repo::set_archived(conn, id, archived)
        })
        .await
    }

    async fn set_presentation<F>(&self, conversation_id: &str, apply: F) -> Result<(), SyncError>
    where
        F: FnOnce(&rusqlite::Connection, &str) -> Result<usize, rusqlite::Error> + Send + 'static,
    {
        let id = conversation_id.to_string();
        let updated = db_call(&self.ctx.pool, move |conn| {
            if apply(conn, &id)? == 0 {
                return Ok(None);
            }
            conversation_repo::get(conn, &id)
        })
        .await?
        .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))?;
        self.ctx.events.publish(StoreEvent::ConversationUpserted {
            conversation: updated,
        });
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────────────

    /// Persist an outgoing message and queue its delivery. The returned
    /// record is already visible in [`SyncEngine::messages`].
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<Message, SyncError> {
        let me = self.ctx.own_user_id("send_message")?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }

        let result = {
            let conversation_id = conversation_id.to_string();
            db_call(&self.ctx.pool, move |conn| {
                let tx = conn.transaction()?;
                let Some(conv) = conversation_repo::get(&tx, &conversation_id)? else {
                    return Ok(None);
                };
                let now = timestamp_now();
                let msg = Message::outgoing(&conversation_id, &me, &text, now);
                message_repo::insert(&tx, &msg)?;
                conversation_repo::set_preview(&tx, &conversation_id, &msg.text, now)?;
                let healed = requeue_create_if_failed(&tx, &conv, now)?;
                let payload = MutationPayload::SendMessage {
                    message_id: msg.id.clone(),
                };
                outbox_repo::enqueue(&tx, &conversation_id, &payload, now)?;
                let conv = if healed {
                    conversation_repo::get(&tx, &conversation_id)?
                } else {
                    None
                };
                tx.commit()?;
                Ok(Some((msg, conv)))
            })
            .await?
        };
        let Some((message, healed_conv)) = result else {
            return Err(SyncError::UnknownConversation(conversation_id.to_string()));
        };

        tracing::info!(message_id = %message.id, conversation_id = %conversation_id,
            "message queued for delivery");
        self.ctx.events.publish(StoreEvent::MessageUpserted {
            message: message.clone(),
        });
        if let Some(conversation) = healed_conv {
            self.ctx
                .events
                .publish(StoreEvent::ConversationUpserted { conversation });
        }
        self.ctx.wake_outbound();
        Ok(message)
    }

    /// Reset a failed message and queue a fresh delivery. Messages in any
    /// other state are returned unchanged.
    pub async fn retry_message(&self, message_id: &str) -> Result<Message, SyncError> {
        self.ctx.own_user_id("retry_message")?;

        let outcome = {
            let message_id = message_id.to_string();
            db_call(&self.ctx.pool, move |conn| {
                let tx = conn.transaction()?;
                let Some(msg) = message_repo::get(&tx, &message_id)? else {
                    return Ok(RetryOutcome::Missing);
                };
                if message_repo::reset_for_retry(&tx, &message_id)? == 0 {
                    return Ok(RetryOutcome::NotFailed(msg));
                }
                let now = timestamp_now();
                let healed = match conversation_repo::get(&tx, &msg.conversation_id)? {
                    Some(conv) => requeue_create_if_failed(&tx, &conv, now)?,
                    None => false,
                };
                let payload = MutationPayload::SendMessage {
                    message_id: message_id.clone(),
                };
                outbox_repo::enqueue(&tx, &msg.conversation_id, &payload, now)?;
                let reloaded = message_repo::get(&tx, &message_id)?;
                let conv = if healed {
                    conversation_repo::get(&tx, &msg.conversation_id)?
                } else {
                    None
                };
                tx.commit()?;
                match reloaded {
                    Some(message) => Ok(RetryOutcome::Reset {
                        message,
                        healed_conv: conv,
                    }),
                    None => Ok(RetryOutcome::Missing),
                }
            })
            .await?
        };

        match outcome {
            RetryOutcome::Missing => Err(SyncError::UnknownMessage(message_id.to_string())),
            RetryOutcome::NotFailed(message) => {
                tracing::debug!(message_id = %message.id, status = message.status.as_str(),
                    "retry requested for a message that is not failed, ignoring");
                Ok(message)
            }
            RetryOutcome::Reset {
                message,
                healed_conv,
            } => {
                tracing::info!(message_id = %message.id, conversation_id = %message.conversation_id,
                    "failed message reset for retry");
                self.ctx.unsuppress(&message.conversation_id);
                self.ctx.events.publish(StoreEvent::MessageUpserted {
                    message: message.clone(),
                });
                if let Some(conversation) = healed_conv {
                    self.ctx
                        .events
                        .publish(StoreEvent::ConversationUpserted { conversation });
                }
                self.ctx.wake_outbound();
                Ok(message)
            }
        }
    }

    /// Mark every incoming message read, locally and (via queued receipts)
    /// for the senders. Safe to call repeatedly; an already-read
    /// conversation is a complete no-op.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<(), SyncError> {
        let me = self.ctx.own_user_id("mark_conversation_read")?;

        let result = {
            let conversation_id = conversation_id.to_string();
            db_call(&self.ctx.pool, move |conn| {
                let tx = conn.transaction()?;
                if conversation_repo::get(&tx, &conversation_id)?.is_none() {
                    return Ok(None);
                }
                let now = timestamp_now();
                let unacked = message_repo::unacked_read_ids(&tx, &conversation_id, &me)?;
                let mut advanced = Vec::with_capacity(unacked.len());
                for message_id in unacked {
                    if message_repo::apply_status(&tx, &message_id, DeliveryStatus::Read)?.is_some()
                    {
                        advanced.push(message_id.clone());
                    }
                    let payload = MutationPayload::UpdateStatus {
                        message_id,
                        status: WireStatus::Read,
                    };
                    outbox_repo::enqueue(&tx, &conversation_id, &payload, now)?;
                }
                let cleared = conversation_repo::reset_unread(&tx, &conversation_id)? > 0;
                tx.commit()?;
                Ok(Some((advanced, cleared)))
            })
            .await?
        };
        let Some((advanced, cleared)) = result else {
            return Err(SyncError::UnknownConversation(conversation_id.to_string()));
        };

        let queued = !advanced.is_empty();
        for message_id in advanced {
            self.ctx.events.publish(StoreEvent::MessageStatusChanged {
                message_id,
                conversation_id: conversation_id.to_string(),
                status: DeliveryStatus::Read,
            });
        }
        if cleared {
            self.ctx.events.publish(StoreEvent::UnreadChanged {
                conversation_id: conversation_id.to_string(),
                unread_count: 0,
            });
        }
        if queued {
            self.ctx.wake_outbound();
        }
        Ok(())
    }

    /// Message history in display order.
    pub async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        let id = conversation_id.to_string();
        db_call(&self.ctx.pool, move |conn| message_repo::history(conn, &id)).await
    }

    /// Messages awaiting a user retry.
    pub async fn failed_messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        let id = conversation_id.to_string();
        db_call(&self.ctx.pool, move |conn| message_repo::failed(conn, &id)).await
    }

    pub async fn message(&self, id: &str) -> Result<Option<Message>, SyncError> {
        let id = id.to_string();
        db_call(&self.ctx.pool, move |conn| message_repo::get(conn, &id)).await
    }

    // ── Listeners ───────────────────────────────────────────────────────────

    /// Begin reconciling a conversation's messages. Idempotent; also lifts
    /// any teardown suppression left on the conversation.
    pub fn start_listening(&self, conversation_id: &str) {
        self.ctx.unsuppress(conversation_id);
        self.listeners.start_message_feed(conversation_id);
    }

    /// Stop reconciling a conversation. Returns once the feed task has
    /// exited; no merge lands after that. Idempotent.
    pub async fn stop_listening(&self, conversation_id: &str) {
        self.listeners.stop_message_feed(conversation_id).await;
    }

    /// Begin reconciling the conversation list. Idempotent.
    pub fn start_conversation_list_sync(&self) {
        self.listeners.start_conversation_list_feed();
    }

    pub async fn stop_conversation_list_sync(&self) {
        self.listeners.stop_conversation_list_feed().await;
    }

    /// Stop a conversation's feed and park its queued mutations. The local
    /// records stay; [`SyncEngine::start_listening`] or a message retry
    /// lifts the suppression.
    pub async fn teardown_conversation(&self, conversation_id: &str) {
        tracing::info!(conversation_id = %conversation_id, "tearing down conversation");
        self.ctx.suppress(conversation_id);
        self.listeners.stop_message_feed(conversation_id).await;
    }

    /// Stop every background task. The replica and queued mutations remain
    /// on disk for the next start.
    pub async fn shutdown(&self) {
        tracing::info!("sync engine shutting down");
        self.listeners.stop_all().await;
        let outbound = self.outbound.lock().take();
        if let Some(worker) = outbound {
            worker.shutdown().await;
        }
    }
}

enum RetryOutcome {
    Missing,
    NotFailed(Message),
    Reset {
        message: Message,
        healed_conv: Option<Conversation>,
    },
}
