//! Remote-to-local reconciliation.
//!
//! Each feed task catches up from a snapshot, then folds live child events
//! into the replica. Every merge runs as one serialized transaction against
//! the replica, keyed on the record id, so redelivered and out-of-order
//! events collapse into no-ops: inserts are suppressed by the existing row,
//! server-assigned fields are adopted at most once, and delivery status only
//! moves through the monotonic guard.
//!
//! Malformed remote payloads are dropped here with a warning; nothing
//! partial ever reaches the replica.

use std::sync::Arc;

use beacon_remote::{RemoteEvent, RemotePath, WireConversation, WireMessage, WireStatus};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::db::timestamp_now;
use crate::db_helpers::db_call;
use crate::events::StoreEvent;
use crate::model::{Conversation, Message, MutationPayload};
use crate::state::EngineState;
use crate::status::DeliveryStatus;
use crate::traits::MessageNotification;
use crate::{conversation_repo, message_repo, outbox_repo};

use super::remote_call;

// ---------------------------------------------------------------------------
// Message feed
// ---------------------------------------------------------------------------

/// Reconcile one conversation's messages until shutdown or cancellation.
///
/// The historical boundary is captured once at feed start: anything the
/// server stamped at or before it was missed while away, anything after it
/// arrived live. Snapshot and subscription overlap by design — the merge
/// collapses the duplicates.
pub(crate) async fn run_message_feed(
    ctx: Arc<EngineState>,
    conversation_id: String,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let boundary = timestamp_now();
    let path = RemotePath::conversation_messages(&conversation_id);

    match remote_call(ctx.config.remote_timeout, ctx.remote.get(&path)).await {
        Ok(Some(Value::Object(children))) => {
            tracing::debug!(conversation_id = %conversation_id, count = children.len(),
                "merging message snapshot");
            for (key, value) in children {
                merge_message(&ctx, &conversation_id, &key, value, boundary).await;
            }
        }
        Ok(Some(other)) => {
            tracing::warn!(conversation_id = %conversation_id, value = %other,
                "message snapshot is not a collection, ignoring");
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, error = %e,
                "message snapshot unavailable, relying on live feed");
        }
    }

    let mut sub = match remote_call(ctx.config.remote_timeout, ctx.remote.subscribe(&path)).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, error = %e,
                "message subscription failed, feed exiting");
            return;
        }
    };

    loop {
        tokio::select! {
            event = sub.recv() => match event {
                Some(RemoteEvent::ChildAdded { key, value }
                    | RemoteEvent::ChildChanged { key, value }) => {
                    merge_message(&ctx, &conversation_id, &key, value, boundary).await;
                }
                Some(RemoteEvent::Cancelled { reason }) => {
                    tracing::warn!(conversation_id = %conversation_id, reason = %reason,
                        "message subscription cancelled by remote");
                    break;
                }
                None => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    tracing::debug!(conversation_id = %conversation_id, "message feed stopped");
}

/// What one merge transaction did to the replica.
enum MessageMerge {
    Inserted {
        message: Message,
        unread: Option<u32>,
        queued_ack: bool,
    },
    Refreshed {
        message: Message,
        adopted: bool,
        advanced: Option<DeliveryStatus>,
    },
    NoConversation,
    Unchanged,
}

async fn merge_message(
    ctx: &Arc<EngineState>,
    conversation_id: &str,
    key: &str,
    value: Value,
    boundary: i64,
) {
    let wire = match WireMessage::from_value(&value) {
        Ok(wire) => wire,
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, key = %key, error = %e,
                "corrupt remote message record, dropping");
            return;
        }
    };
    if wire.id != key || wire.conversation_id != conversation_id {
        tracing::warn!(conversation_id = %conversation_id, key = %key, message_id = %wire.id,
            "remote message record does not match its location, dropping");
        return;
    }
    let Some(me) = ctx.identity.current_user_id() else {
        tracing::warn!(conversation_id = %conversation_id, key = %key,
            "no signed-in user, dropping remote message event");
        return;
    };

    let incoming = wire.sender_id != me;
    let outcome = db_call(&ctx.pool, {
        let me = me.clone();
        move |conn| {
            let tx = conn.transaction()?;
            if conversation_repo::get(&tx, &wire.conversation_id)?.is_none() {
                return Ok(MessageMerge::NoConversation);
            }
            let outcome = match message_repo::get(&tx, &wire.id)? {
                None => {
                    let msg = Message::from_wire(wire);
                    message_repo::insert(&tx, &msg)?;
                    conversation_repo::set_preview(
                        &tx,
                        &msg.conversation_id,
                        &msg.text,
                        msg.server_timestamp.unwrap_or(msg.local_created_at),
                    )?;
                    let incoming = msg.sender_id != me;
                    let unread = if incoming && msg.status != DeliveryStatus::Read {
                        Some(conversation_repo::bump_unread(&tx, &msg.conversation_id)?)
                    } else {
                        None
                    };
                    // Acknowledge receipt so the sender sees "delivered";
                    // never regress a record already delivered or read.
                    let queued_ack = incoming && msg.status == DeliveryStatus::Sent;
                    if queued_ack {
                        let payload = MutationPayload::UpdateStatus {
                            message_id: msg.id.clone(),
                            status: WireStatus::Delivered,
                        };
                        outbox_repo::enqueue(&tx, &msg.conversation_id, &payload, timestamp_now())?;
                    }
                    MessageMerge::Inserted {
                        message: msg,
                        unread,
                        queued_ack,
                    }
                }
                Some(_) => {
                    let adopted = message_repo::adopt_server_fields(
                        &tx,
                        &wire.id,
                        wire.server_timestamp,
                        wire.sequence_number,
                    )? > 0;
                    let advanced = message_repo::apply_status(
                        &tx,
                        &wire.id,
                        DeliveryStatus::from_wire(wire.status),
                    )?;
                    if adopted || advanced.is_some() {
                        match message_repo::get(&tx, &wire.id)? {
                            Some(message) => MessageMerge::Refreshed {
                                message,
                                adopted,
                                advanced,
                            },
                            None => MessageMerge::Unchanged,
                        }
                    } else {
                        MessageMerge::Unchanged
                    }
                }
            };
            tx.commit()?;
            Ok(outcome)
        }
    })
    .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, key = %key, error = %e,
                "failed to merge remote message");
            return;
        }
    };

    match outcome {
        MessageMerge::Inserted {
            message,
            unread,
            queued_ack,
        } => {
            let historical = message.server_timestamp.unwrap_or(i64::MAX) <= boundary;
            tracing::info!(message_id = %message.id, conversation_id = %conversation_id,
                historical, "merged remote message");
            ctx.events.publish(StoreEvent::MessageUpserted {
                message: message.clone(),
            });
            if let Some(unread_count) = unread {
                ctx.events.publish(StoreEvent::UnreadChanged {
                    conversation_id: conversation_id.to_string(),
                    unread_count,
                });
            }
            if incoming {
                ctx.notifier.message_merged(&MessageNotification {
                    conversation_id: conversation_id.to_string(),
                    message_id: message.id.clone(),
                    sender_id: message.sender_id.clone(),
                    body: message.text.clone(),
                    is_historical: historical,
                });
            }
            if queued_ack {
                ctx.wake_outbound();
            }
        }
        MessageMerge::Refreshed {
            message,
            adopted,
            advanced,
        } => {
            if adopted {
                tracing::debug!(message_id = %message.id, "adopted server fields from echo");
                ctx.events.publish(StoreEvent::MessageUpserted {
                    message: message.clone(),
                });
            }
            if let Some(status) = advanced {
                ctx.events.publish(StoreEvent::MessageStatusChanged {
                    message_id: message.id,
                    conversation_id: conversation_id.to_string(),
                    status,
                });
            }
        }
        MessageMerge::NoConversation => {
            // The record stays remote; a later snapshot re-merges it once
            // the conversation is known.
            tracing::warn!(conversation_id = %conversation_id, key = %key,
                "remote message for unknown conversation, skipping");
        }
        MessageMerge::Unchanged => {}
    }
}

// ---------------------------------------------------------------------------
// Conversation list feed
// ---------------------------------------------------------------------------

/// Reconcile the conversation collection until shutdown or cancellation.
/// Only records listing the signed-in user as a participant are adopted.
pub(crate) async fn run_conversation_list_feed(
    ctx: Arc<EngineState>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let path = RemotePath::Conversations;

    match remote_call(ctx.config.remote_timeout, ctx.remote.get(&path)).await {
        Ok(Some(Value::Object(children))) => {
            tracing::debug!(count = children.len(), "merging conversation snapshot");
            for (key, value) in children {
                merge_conversation(&ctx, &key, value).await;
            }
        }
        Ok(Some(other)) => {
            tracing::warn!(value = %other, "conversation snapshot is not a collection, ignoring");
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(error = %e, "conversation snapshot unavailable, relying on live feed");
        }
    }

    let mut sub = match remote_call(ctx.config.remote_timeout, ctx.remote.subscribe(&path)).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(error = %e, "conversation subscription failed, feed exiting");
            return;
        }
    };

    loop {
        tokio::select! {
            event = sub.recv() => match event {
                Some(RemoteEvent::ChildAdded { key, value }
                    | RemoteEvent::ChildChanged { key, value }) => {
                    merge_conversation(&ctx, &key, value).await;
                }
                Some(RemoteEvent::Cancelled { reason }) => {
                    tracing::warn!(reason = %reason, "conversation subscription cancelled by remote");
                    break;
                }
                None => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    tracing::debug!("conversation list feed stopped");
}

enum ConversationMerge {
    Inserted(Conversation),
    Updated(Conversation),
    Unchanged,
}

async fn merge_conversation(ctx: &Arc<EngineState>, key: &str, value: Value) {
    let wire = match WireConversation::from_value(&value) {
        Ok(wire) => wire,
        Err(e) => {
            tracing::warn!(key = %key, error = %e,
                "corrupt remote conversation record, dropping");
            return;
        }
    };
    if wire.id != key {
        tracing::warn!(key = %key, conversation_id = %wire.id,
            "remote conversation record does not match its location, dropping");
        return;
    }
    let Some(me) = ctx.identity.current_user_id() else {
        tracing::warn!(key = %key, "no signed-in user, dropping remote conversation event");
        return;
    };
    if !wire.participant_ids.contains(&me) {
        tracing::debug!(conversation_id = %wire.id, "conversation does not involve us, skipping");
        return;
    }

    let outcome = db_call(&ctx.pool, move |conn| {
        let tx = conn.transaction()?;
        let outcome = match conversation_repo::get(&tx, &wire.id)? {
            None => {
                let conv = Conversation::from_wire(wire);
                conversation_repo::insert(&tx, &conv)?;
                ConversationMerge::Inserted(conv)
            }
            Some(_) => {
                if conversation_repo::apply_remote(&tx, &wire)? {
                    match conversation_repo::get(&tx, &wire.id)? {
                        Some(conv) => ConversationMerge::Updated(conv),
                        None => ConversationMerge::Unchanged,
                    }
                } else {
                    ConversationMerge::Unchanged
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    })
    .await;

    match outcome {
        Ok(ConversationMerge::Inserted(conversation)) => {
            tracing::info!(conversation_id = %conversation.id, "adopted remote conversation");
            ctx.events
                .publish(StoreEvent::ConversationUpserted { conversation });
        }
        Ok(ConversationMerge::Updated(conversation)) => {
            ctx.events
                .publish(StoreEvent::ConversationUpserted { conversation });
        }
        Ok(ConversationMerge::Unchanged) => {}
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "failed to merge remote conversation");
        }
    }
}
