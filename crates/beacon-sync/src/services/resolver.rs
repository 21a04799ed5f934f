//! Conversation resolution.
//!
//! Settles "which conversation do these participants share" before any
//! message flows. Direct conversations get a deterministic id derived from
//! the participant pair, so both sides resolve to the same record without
//! coordination; groups get a random id minted by whoever creates them.
//!
//! Resolution order: local replica, then the remote store, then an
//! optimistic create. The remote lookup is best-effort — offline or corrupt
//! answers degrade to the optimistic path, and the queued create converges
//! with whatever the other side did.

use std::sync::Arc;

use beacon_remote::{RemotePath, WireConversation};

use crate::db::timestamp_now;
use crate::db_helpers::db_call;
use crate::error::{SyncError, ValidationError};
use crate::model::{direct_conversation_id, Conversation, MutationPayload, SyncStatus};
use crate::state::EngineState;
use crate::{conversation_repo, outbox_repo};

use super::remote_call;

/// Resolve (or create) the direct conversation with `other_user_id`.
pub async fn create_or_get(
    ctx: &Arc<EngineState>,
    other_user_id: &str,
) -> Result<Conversation, SyncError> {
    let me = ctx.own_user_id("create_conversation")?;
    let other = other_user_id.trim().to_string();
    if other.is_empty() {
        return Err(ValidationError::UnknownRecipient(other).into());
    }
    if other == me {
        return Err(ValidationError::SelfMessage.into());
    }
    ctx.policy.check(&me, std::slice::from_ref(&other)).await?;

    let id = direct_conversation_id(&me, &other);

    // Fast path: already in the replica. A record whose remote create was
    // abandoned gets the create re-queued here.
    let local = {
        let id = id.clone();
        db_call(&ctx.pool, move |conn| {
            let tx = conn.transaction()?;
            let result = match conversation_repo::get(&tx, &id)? {
                Some(conv) => {
                    let healed = requeue_create_if_failed(&tx, &conv, timestamp_now())?;
                    let conv = if healed {
                        conversation_repo::get(&tx, &id)?.unwrap_or(conv)
                    } else {
                        conv
                    };
                    Some((conv, healed))
                }
                None => None,
            };
            tx.commit()?;
            Ok(result)
        })
        .await?
    };
    if let Some((existing, healed)) = local {
        tracing::debug!(conversation_id = %id, healed, "conversation already known locally");
        if healed {
            ctx.events.publish(crate::events::StoreEvent::ConversationUpserted {
                conversation: existing.clone(),
            });
            ctx.wake_outbound();
        }
        return Ok(existing);
    }

    // The other side may have created it first; adopt their record if so.
    match remote_call(
        ctx.config.remote_timeout,
        ctx.remote.get(&RemotePath::conversation(&id)),
    )
    .await
    {
        Ok(Some(value)) => match WireConversation::from_value(&value) {
            Ok(wire) => return adopt_remote(ctx, wire).await,
            Err(e) => {
                tracing::warn!(conversation_id = %id, error = %e,
                    "corrupt remote conversation record, recreating");
            }
        },
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(conversation_id = %id, error = %e,
                "remote lookup unavailable, creating optimistically");
        }
    }

    let conv = Conversation::direct(&me, &other, timestamp_now());
    persist_new(ctx, conv, true).await
}

/// Create a group conversation with a fresh random id.
pub async fn create_group(
    ctx: &Arc<EngineState>,
    other_user_ids: &[String],
    display_name: Option<String>,
) -> Result<Conversation, SyncError> {
    let me = ctx.own_user_id("create_group")?;
    let others: Vec<String> = other_user_ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && *id != me)
        .collect();
    if others.is_empty() {
        return Err(ValidationError::NoParticipants.into());
    }
    ctx.policy.check(&me, &others).await?;

    let conv = Conversation::group(&me, others, display_name, timestamp_now());
    persist_new(ctx, conv, true).await
}

/// Insert a remote conversation record into the replica, already synced.
/// Used both by the resolver's remote fast path and by the conversation
/// list reconciler when a new conversation appears.
pub(crate) async fn adopt_remote(
    ctx: &Arc<EngineState>,
    wire: WireConversation,
) -> Result<Conversation, SyncError> {
    tracing::info!(conversation_id = %wire.id, "adopting remote conversation");
    persist_new(ctx, Conversation::from_wire(wire), false).await
}

/// Re-queue the remote create for a conversation whose previous create was
/// abandoned, flipping it back to pending so the create is only queued once.
/// Returns whether anything was queued.
pub(crate) fn requeue_create_if_failed(
    tx: &rusqlite::Transaction<'_>,
    conv: &Conversation,
    now: i64,
) -> Result<bool, rusqlite::Error> {
    if conv.sync_status != SyncStatus::Failed {
        return Ok(false);
    }
    tracing::info!(conversation_id = %conv.id, "re-queueing abandoned conversation create");
    conversation_repo::set_sync_status(tx, &conv.id, SyncStatus::Pending)?;
    let payload = MutationPayload::CreateConversation {
        conversation_id: conv.id.clone(),
    };
    outbox_repo::enqueue(tx, &conv.id, &payload, now)?;
    Ok(true)
}

/// Insert the record unless a concurrent caller beat us to it, optionally
/// queueing the remote create in the same transaction.
async fn persist_new(
    ctx: &Arc<EngineState>,
    conv: Conversation,
    queue_create: bool,
) -> Result<Conversation, SyncError> {
    let id = conv.id.clone();
    let (conv, created) = db_call(&ctx.pool, move |conn| {
        let tx = conn.transaction()?;
        let result = if let Some(existing) = conversation_repo::get(&tx, &conv.id)? {
            (existing, false)
        } else {
            conversation_repo::insert(&tx, &conv)?;
            if queue_create {
                let payload = MutationPayload::CreateConversation {
                    conversation_id: conv.id.clone(),
                };
                outbox_repo::enqueue(&tx, &conv.id, &payload, timestamp_now())?;
            }
            (conv, true)
        };
        tx.commit()?;
        Ok(result)
    })
    .await?;

    if created {
        tracing::info!(conversation_id = %id, queued = queue_create, "conversation created");
        ctx.events.publish(crate::events::StoreEvent::ConversationUpserted {
            conversation: conv.clone(),
        });
        if queue_create {
            ctx.wake_outbound();
        }
    }
    Ok(conv)
}
