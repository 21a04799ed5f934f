//! Outbound queue worker.
//!
//! Single background task that drains the `outbox` table toward the remote
//! store. Runs on a fixed tick plus an explicit wake from every enqueue, so
//! new work is picked up immediately while a quiet queue costs one query per
//! tick. Only conversation queue heads are dispatched, keeping delivery FIFO
//! per conversation; independent conversations dispatch concurrently.
//!
//! Remote failures are classified by [`beacon_remote::RemoteError::is_transient`]:
//! transient errors reschedule the mutation with exponential backoff and
//! jitter, anything else (and a transient error past the attempt cap)
//! abandons it. Abandoning a send parks the message in `failed` for an
//! explicit user retry; abandoning a status receipt just drops it.

use std::sync::Arc;
use std::time::Duration;

use beacon_remote::{RemoteError, RemotePath, WireMessage, WireStatus};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::db::timestamp_now;
use crate::db_helpers::{db_call, db_call_or_default, db_fire};
use crate::error::SyncError;
use crate::events::StoreEvent;
use crate::model::{MutationPayload, OutboundMutation, SyncStatus};
use crate::state::EngineState;
use crate::{conversation_repo, message_repo, outbox_repo};

use super::remote_call;

/// A running outbound worker. Dropping the handle detaches the task; call
/// [`OutboundHandle::shutdown`] for an orderly stop.
pub struct OutboundHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl OutboundHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

/// Spawn the worker. The first tick fires immediately, which is what replays
/// mutations left over from a previous run.
pub fn start(ctx: Arc<EngineState>) -> OutboundHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(ctx.config.worker_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!("outbound worker started");
        loop {
            tokio::select! {
                _ = tick.tick() => flush(&ctx).await,
                () = ctx.wake.notified() => flush(&ctx).await,
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("outbound worker stopped");
    });
    OutboundHandle {
        shutdown_tx,
        handle,
    }
}

/// Dispatch every due conversation head concurrently.
async fn flush(ctx: &Arc<EngineState>) {
    let now = timestamp_now();
    let due = db_call_or_default(&ctx.pool, move |conn| outbox_repo::due_heads(conn, now)).await;
    let due: Vec<OutboundMutation> = due
        .into_iter()
        .filter(|m| !ctx.is_suppressed(&m.conversation_id))
        .collect();
    if due.is_empty() {
        return;
    }
    tracing::debug!(count = due.len(), "dispatching outbound mutations");
    futures::future::join_all(due.into_iter().map(|m| dispatch(ctx, m))).await;
}

async fn dispatch(ctx: &Arc<EngineState>, mutation: OutboundMutation) {
    if ctx.is_suppressed(&mutation.conversation_id) {
        return;
    }
    let result = match mutation.payload.clone() {
        MutationPayload::CreateConversation { conversation_id } => {
            push_conversation(ctx, mutation.id, &conversation_id).await
        }
        MutationPayload::SendMessage { message_id } => {
            push_message(ctx, mutation.id, &message_id).await
        }
        MutationPayload::UpdateStatus { message_id, status } => {
            push_status(ctx, mutation.id, &mutation.conversation_id, &message_id, status).await
        }
    };
    match result {
        Ok(()) => {}
        Err(SyncError::Remote(e)) if e.is_transient() => bump_or_abandon(ctx, &mutation, &e).await,
        Err(SyncError::Remote(e)) => abandon(ctx, &mutation, &e).await,
        Err(e) => {
            // Local store trouble: leave the mutation untouched and let the
            // next tick retry without burning an attempt.
            tracing::warn!(mutation_id = mutation.id, error = %e,
                "outbound dispatch hit a local error, retrying next tick");
        }
    }
}

/// Write the conversation record. Skips (and clears the mutation) when the
/// record is gone or was already synced by the reconciler.
async fn push_conversation(
    ctx: &Arc<EngineState>,
    mutation_id: i64,
    conversation_id: &str,
) -> Result<(), SyncError> {
    let conv = {
        let id = conversation_id.to_string();
        db_call(&ctx.pool, move |conn| conversation_repo::get(conn, &id)).await?
    };
    let Some(conv) = conv else {
        tracing::warn!(conversation_id = %conversation_id,
            "queued conversation create has no local record, dropping");
        clear_mutation(ctx, mutation_id).await?;
        return Ok(());
    };
    if conv.sync_status == SyncStatus::Synced {
        clear_mutation(ctx, mutation_id).await?;
        return Ok(());
    }

    let value = serde_json::to_value(conv.to_wire()).map_err(RemoteError::from)?;
    remote_call(
        ctx.config.remote_timeout,
        ctx.remote.write(&RemotePath::conversation(&conv.id), value),
    )
    .await?;

    let updated = {
        let id = conv.id.clone();
        db_call(&ctx.pool, move |conn| {
            let tx = conn.transaction()?;
            outbox_repo::delete(&tx, mutation_id)?;
            conversation_repo::set_sync_status(&tx, &id, SyncStatus::Synced)?;
            let updated = conversation_repo::get(&tx, &id)?;
            tx.commit()?;
            Ok(updated)
        })
        .await?
    };
    tracing::info!(conversation_id = %conv.id, "conversation record written to remote store");
    if let Some(conversation) = updated {
        ctx.events
            .publish(StoreEvent::ConversationUpserted { conversation });
    }
    Ok(())
}

/// Deliver a queued message. Skips delivery when the reconciler's echo
/// already confirmed it.
async fn push_message(
    ctx: &Arc<EngineState>,
    mutation_id: i64,
    message_id: &str,
) -> Result<(), SyncError> {
    let msg = {
        let id = message_id.to_string();
        db_call(&ctx.pool, move |conn| message_repo::get(conn, &id)).await?
    };
    let Some(msg) = msg else {
        tracing::warn!(message_id = %message_id, "queued message has no local record, dropping");
        clear_mutation(ctx, mutation_id).await?;
        return Ok(());
    };
    if msg.sync_status == SyncStatus::Synced {
        clear_mutation(ctx, mutation_id).await?;
        return Ok(());
    }

    {
        let id = msg.id.clone();
        let now = timestamp_now();
        db_fire(&ctx.pool, "record send attempt", move |conn| {
            message_repo::record_attempt(conn, &id, now)
        });
    }

    let value = WireMessage::outgoing(
        &msg.id,
        &msg.conversation_id,
        &msg.sender_id,
        &msg.text,
        WireStatus::Sent,
    );
    remote_call(
        ctx.config.remote_timeout,
        ctx.remote
            .write(&RemotePath::message(&msg.conversation_id, &msg.id), value),
    )
    .await?;

    let updated = {
        let id = msg.id.clone();
        db_call(&ctx.pool, move |conn| {
            let tx = conn.transaction()?;
            outbox_repo::delete(&tx, mutation_id)?;
            message_repo::mark_acked(&tx, &id, timestamp_now())?;
            let updated = message_repo::get(&tx, &id)?;
            tx.commit()?;
            Ok(updated)
        })
        .await?
    };
    tracing::info!(message_id = %msg.id, conversation_id = %msg.conversation_id,
        "message delivered to remote store");
    if let Some(message) = updated {
        ctx.events.publish(StoreEvent::MessageUpserted { message });
    }
    Ok(())
}

/// Push a delivery/read receipt as a field update on the remote record.
async fn push_status(
    ctx: &Arc<EngineState>,
    mutation_id: i64,
    conversation_id: &str,
    message_id: &str,
    status: WireStatus,
) -> Result<(), SyncError> {
    let mut fields = serde_json::Map::new();
    fields.insert(
        "status".to_string(),
        serde_json::Value::String(status.as_str().to_string()),
    );
    remote_call(
        ctx.config.remote_timeout,
        ctx.remote
            .update(&RemotePath::message(conversation_id, message_id), fields),
    )
    .await?;
    clear_mutation(ctx, mutation_id).await?;
    tracing::debug!(message_id = %message_id, status = status.as_str(), "status receipt pushed");
    Ok(())
}

async fn clear_mutation(ctx: &Arc<EngineState>, mutation_id: i64) -> Result<(), SyncError> {
    db_call(&ctx.pool, move |conn| {
        outbox_repo::delete(conn, mutation_id)?;
        Ok(())
    })
    .await
}

/// Schedule another attempt, or abandon once the attempt cap is reached.
async fn bump_or_abandon(ctx: &Arc<EngineState>, mutation: &OutboundMutation, error: &RemoteError) {
    let attempt = mutation.attempt + 1;
    if attempt >= ctx.config.max_send_attempts {
        abandon(ctx, mutation, error).await;
        return;
    }
    let delay = backoff_delay(&ctx.config, attempt);
    let next_retry_at =
        timestamp_now().saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
    tracing::debug!(mutation_id = mutation.id, attempt, delay = ?delay,
        error = %error, "outbound attempt failed, backing off");
    let id = mutation.id;
    if let Err(e) = db_call(&ctx.pool, move |conn| {
        outbox_repo::bump(conn, id, attempt, next_retry_at)
    })
    .await
    {
        tracing::warn!(mutation_id = id, error = %e, "failed to reschedule mutation");
    }
}

/// Drop a mutation that will never be delivered, recording the failure where
/// the user can see it.
async fn abandon(ctx: &Arc<EngineState>, mutation: &OutboundMutation, error: &RemoteError) {
    let mutation_id = mutation.id;
    match mutation.payload.clone() {
        MutationPayload::SendMessage { message_id } => {
            tracing::warn!(message_id = %message_id, attempts = mutation.attempt + 1,
                error = %error, "abandoning message send, awaiting user retry");
            let reason = error.to_string();
            let result = {
                let id = message_id.clone();
                db_call(&ctx.pool, move |conn| {
                    let tx = conn.transaction()?;
                    outbox_repo::delete(&tx, mutation_id)?;
                    message_repo::mark_failed(&tx, &id, &reason, timestamp_now())?;
                    tx.commit()?;
                    Ok(())
                })
                .await
            };
            if let Err(e) = result {
                tracing::warn!(message_id = %message_id, error = %e,
                    "failed to park abandoned message");
                return;
            }
            ctx.events.publish(StoreEvent::MessageSyncFailed {
                message_id,
                conversation_id: mutation.conversation_id.clone(),
                error: error.to_string(),
            });
        }
        MutationPayload::CreateConversation { conversation_id } => {
            tracing::warn!(conversation_id = %conversation_id, attempts = mutation.attempt + 1,
                error = %error, "abandoning conversation create");
            let result = {
                let id = conversation_id.clone();
                db_call(&ctx.pool, move |conn| {
                    let tx = conn.transaction()?;
                    outbox_repo::delete(&tx, mutation_id)?;
                    conversation_repo::set_sync_status(&tx, &id, SyncStatus::Failed)?;
                    let updated = conversation_repo::get(&tx, &id)?;
                    tx.commit()?;
                    Ok(updated)
                })
                .await
            };
            match result {
                Ok(Some(conversation)) => {
                    ctx.events
                        .publish(StoreEvent::ConversationUpserted { conversation });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e,
                        "failed to park abandoned conversation create");
                }
            }
        }
        MutationPayload::UpdateStatus { message_id, status } => {
            // Receipts are best-effort; the other side just sees a staler
            // status until a later receipt lands.
            tracing::warn!(message_id = %message_id, status = status.as_str(),
                attempts = mutation.attempt + 1, error = %error, "dropping status receipt");
            if let Err(e) = clear_mutation(ctx, mutation_id).await {
                tracing::warn!(mutation_id, error = %e, "failed to drop status receipt");
            }
        }
    }
}

/// Exponential backoff with jitter: `initial * 2^(attempt-1)` capped at
/// `backoff_max`, plus up to half of that again so stalled peers don't
/// reconnect in lockstep.
pub(crate) fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let doubled = config
        .backoff_initial
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = doubled.min(config.backoff_max);
    let half_ms = u64::try_from(capped.as_millis() / 2).unwrap_or(u64::MAX);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=half_ms));
    capped.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            ..SyncConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let config = config();
        for (attempt, base_secs) in [(1u32, 1u64), (2, 2), (3, 4), (4, 8), (7, 60), (30, 60)] {
            let delay = backoff_delay(&config, attempt);
            let base = Duration::from_secs(base_secs.min(60));
            assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
            assert!(
                delay <= base + base / 2,
                "attempt {attempt}: {delay:?} too long"
            );
        }
    }

    #[test]
    fn backoff_huge_attempt_does_not_overflow() {
        let delay = backoff_delay(&config(), u32::MAX);
        assert!(delay <= Duration::from_secs(90));
    }
}
