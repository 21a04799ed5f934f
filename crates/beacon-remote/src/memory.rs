//! In-process [`RemoteStore`] implementation.
//!
//! A complete store, not a mock: hierarchical records, server-value
//! substitution, replay-then-live subscriptions, and an offline fault flag.
//! Integration tests run engines against a shared `MemoryRemote` the same
//! way production code runs against the hosted store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::path::RemotePath;
use crate::store::{RemoteEvent, RemoteStore, Subscription};
use crate::wire::{SERVER_VALUE_KEY, SV_SEQUENCE, SV_TIMESTAMP};

/// Live-event headroom beyond the replay size for a new subscription.
const CHANNEL_HEADROOM: usize = 256;

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Record paths only; collections are derived by parent lookup.
    records: HashMap<RemotePath, Value>,
    /// Per-collection monotonic counters for `{".sv":"sequence"}`.
    sequences: HashMap<RemotePath, i64>,
    watchers: HashMap<RemotePath, Vec<Watcher>>,
    next_watcher_id: u64,
    offline: bool,
}

struct Watcher {
    id: u64,
    tx: mpsc::Sender<RemoteEvent>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail all subsequent operations with [`RemoteError::Offline`] until
    /// cleared. Already-open subscriptions keep their feeds; only new
    /// operations are gated, matching a client library that buffers across
    /// connectivity loss.
    pub fn set_offline(&self, offline: bool) {
        self.inner.state.lock().offline = offline;
    }

    /// Number of live watchers on a collection path.
    pub fn watcher_count(&self, path: &RemotePath) -> usize {
        self.inner
            .state
            .lock()
            .watchers
            .get(path)
            .map_or(0, Vec::len)
    }

    /// Terminate every subscription on `path`, delivering `Cancelled` to
    /// each before its feed closes.
    pub fn cancel_subscriptions(&self, path: &RemotePath, reason: &str) {
        let watchers = self.inner.state.lock().watchers.remove(path);
        if let Some(watchers) = watchers {
            for watcher in watchers {
                let _ = watcher.tx.try_send(RemoteEvent::Cancelled {
                    reason: reason.to_string(),
                });
            }
        }
    }
}

impl State {
    fn children_of(&self, collection: &RemotePath) -> Vec<(String, Value)> {
        let mut children: Vec<(String, Value)> = self
            .records
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(collection))
            .map(|(path, value)| (path.key().to_string(), value.clone()))
            .collect();
        // Replay and snapshot order is by child key, as a hosted store would.
        children.sort_by(|a, b| a.0.cmp(&b.0));
        children
    }

    fn fanout(&mut self, collection: &RemotePath, event: &RemoteEvent) {
        let Some(watchers) = self.watchers.get_mut(collection) else {
            return;
        };
        watchers.retain(|watcher| match watcher.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    path = %collection,
                    watcher = watcher.id,
                    "subscriber buffer full, cutting watcher off"
                );
                false
            }
        });
        if watchers.is_empty() {
            self.watchers.remove(collection);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn write(&self, path: &RemotePath, value: Value) -> Result<(), RemoteError> {
        let Some(collection) = path.parent() else {
            return Err(RemoteError::InvalidPath(format!(
                "write expects a record path, got {path}"
            )));
        };
        let mut state = self.inner.state.lock();
        if state.offline {
            return Err(RemoteError::Offline);
        }
        let now = now_ms();
        let substituted = substitute(value, &mut state.sequences, &collection, now);
        let existed = state
            .records
            .insert(path.clone(), substituted.clone())
            .is_some();
        let key = path.key().to_string();
        let event = if existed {
            RemoteEvent::ChildChanged {
                key,
                value: substituted,
            }
        } else {
            RemoteEvent::ChildAdded {
                key,
                value: substituted,
            }
        };
        state.fanout(&collection, &event);
        Ok(())
    }

    async fn update(
        &self,
        path: &RemotePath,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        let Some(collection) = path.parent() else {
            return Err(RemoteError::InvalidPath(format!(
                "update expects a record path, got {path}"
            )));
        };
        let mut state = self.inner.state.lock();
        if state.offline {
            return Err(RemoteError::Offline);
        }
        let now = now_ms();
        let fields: Map<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k, substitute(v, &mut state.sequences, &collection, now)))
            .collect();
        // Updating a missing record upserts the given fields.
        let (merged, existed) = match state.records.get(path) {
            Some(Value::Object(existing)) => {
                let mut merged = existing.clone();
                for (k, v) in fields {
                    merged.insert(k, v);
                }
                (Value::Object(merged), true)
            }
            Some(_) => (Value::Object(fields), true),
            None => (Value::Object(fields), false),
        };
        state.records.insert(path.clone(), merged.clone());
        let key = path.key().to_string();
        let event = if existed {
            RemoteEvent::ChildChanged { key, value: merged }
        } else {
            RemoteEvent::ChildAdded { key, value: merged }
        };
        state.fanout(&collection, &event);
        Ok(())
    }

    async fn get(&self, path: &RemotePath) -> Result<Option<Value>, RemoteError> {
        let state = self.inner.state.lock();
        if state.offline {
            return Err(RemoteError::Offline);
        }
        if path.is_collection() {
            let children = state.children_of(path);
            if children.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Value::Object(children.into_iter().collect())));
        }
        Ok(state.records.get(path).cloned())
    }

    async fn subscribe(&self, path: &RemotePath) -> Result<Subscription, RemoteError> {
        if !path.is_collection() {
            return Err(RemoteError::InvalidPath(format!(
                "subscribe expects a collection path, got {path}"
            )));
        }
        let mut state = self.inner.state.lock();
        if state.offline {
            return Err(RemoteError::Offline);
        }
        let children = state.children_of(path);
        // Capacity covers the whole replay, so it can never be lossy.
        let (tx, rx) = mpsc::channel(children.len() + CHANNEL_HEADROOM);
        for (key, value) in children {
            let _ = tx.try_send(RemoteEvent::ChildAdded { key, value });
        }
        let id = state.next_watcher_id;
        state.next_watcher_id += 1;
        state
            .watchers
            .entry(path.clone())
            .or_default()
            .push(Watcher { id, tx });

        let inner = Arc::clone(&self.inner);
        let watched = path.clone();
        Ok(Subscription::new(rx, move || {
            let mut state = inner.state.lock();
            if let Some(watchers) = state.watchers.get_mut(&watched) {
                watchers.retain(|watcher| watcher.id != id);
                if watchers.is_empty() {
                    state.watchers.remove(&watched);
                }
            }
        }))
    }
}

/// Replace server-value sentinels anywhere in `value`.
fn substitute(
    value: Value,
    sequences: &mut HashMap<RemotePath, i64>,
    collection: &RemotePath,
    now: i64,
) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                let sentinel = map
                    .get(SERVER_VALUE_KEY)
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                match sentinel.as_deref() {
                    Some(SV_TIMESTAMP) => return Value::from(now),
                    Some(SV_SEQUENCE) => {
                        let seq = sequences.entry(collection.clone()).or_insert(0);
                        *seq += 1;
                        return Value::from(*seq);
                    }
                    _ => {}
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, substitute(v, sequences, collection, now)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, sequences, collection, now))
                .collect(),
        ),
        other => other,
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_timestamp_and_sequence_sentinels() {
        let mut sequences = HashMap::new();
        let collection = RemotePath::conversation_messages("c");
        let value = json!({
            "serverTimestamp": { SERVER_VALUE_KEY: SV_TIMESTAMP },
            "sequenceNumber": { SERVER_VALUE_KEY: SV_SEQUENCE },
            "text": "hi",
        });
        let out = substitute(value, &mut sequences, &collection, 1234);
        assert_eq!(out["serverTimestamp"], json!(1234));
        assert_eq!(out["sequenceNumber"], json!(1));
        assert_eq!(out["text"], json!("hi"));
    }

    #[test]
    fn sequence_counter_is_per_collection_and_monotonic() {
        let mut sequences = HashMap::new();
        let a = RemotePath::conversation_messages("a");
        let b = RemotePath::conversation_messages("b");
        let sv = || json!({ SERVER_VALUE_KEY: SV_SEQUENCE });
        assert_eq!(substitute(sv(), &mut sequences, &a, 0), json!(1));
        assert_eq!(substitute(sv(), &mut sequences, &a, 0), json!(2));
        assert_eq!(substitute(sv(), &mut sequences, &b, 0), json!(1));
        assert_eq!(substitute(sv(), &mut sequences, &a, 0), json!(3));
    }

    #[test]
    fn unknown_sentinel_passes_through_unchanged() {
        let mut sequences = HashMap::new();
        let collection = RemotePath::Conversations;
        let value = json!({ SERVER_VALUE_KEY: "increment" });
        let out = substitute(value.clone(), &mut sequences, &collection, 0);
        assert_eq!(out, value);
    }
}
