//! The remote real-time store contract.
//!
//! Implementations expose a small hierarchical-store surface: full-value
//! writes, partial updates, point reads, and live child subscriptions on
//! collection paths. The engine is written entirely against [`RemoteStore`];
//! [`crate::MemoryRemote`] is a complete in-process implementation used by
//! integration tests and local development.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::path::RemotePath;

/// A change delivered to a collection subscriber.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    /// A child appeared under the subscribed collection. Subscriptions begin
    /// with a replay of all existing children as `ChildAdded`, then go live.
    ChildAdded { key: String, value: Value },
    /// An existing child's value changed.
    ChildChanged { key: String, value: Value },
    /// The subscription was terminated by the store; no further events
    /// follow. Subscribers treat this as a signal to stop, not an error.
    Cancelled { reason: String },
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Put a full value at a record path.
    ///
    /// Commits atomically and fans out to subscribers of the parent
    /// collection: `ChildAdded` if the record did not exist, `ChildChanged`
    /// if it did. Server-value sentinels (see [`crate::wire`]) are
    /// substituted at commit time.
    async fn write(&self, path: &RemotePath, value: Value) -> Result<(), RemoteError>;

    /// Merge `fields` into the record at a record path.
    ///
    /// Updating a missing record upserts the given fields. Sentinels are
    /// substituted as in [`RemoteStore::write`].
    async fn update(
        &self,
        path: &RemotePath,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError>;

    /// Point read. A record path yields the record; a collection path yields
    /// the map of children. A location that does not exist yields `None`.
    async fn get(&self, path: &RemotePath) -> Result<Option<Value>, RemoteError>;

    /// Open a live child feed on a collection path.
    ///
    /// Existing children are replayed as `ChildAdded` before live events, so
    /// a snapshot taken just before subscribing overlaps the feed rather
    /// than racing it. Dropping the returned [`Subscription`] unregisters
    /// the watcher.
    async fn subscribe(&self, path: &RemotePath) -> Result<Subscription, RemoteError>;
}

/// A live feed of [`RemoteEvent`]s for one collection.
///
/// Owns the watcher registration: dropping the subscription (on any exit
/// path, including task abort) unregisters it at the store. There is no
/// manual detach to forget.
pub struct Subscription {
    rx: mpsc::Receiver<RemoteEvent>,
    _guard: SubscriptionGuard,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(
        rx: mpsc::Receiver<RemoteEvent>,
        unregister: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            _guard: SubscriptionGuard {
                unregister: Some(Box::new(unregister)),
            },
        }
    }

    /// Next event, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<RemoteEvent> {
        self.rx.recv().await
    }
}

struct SubscriptionGuard {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}
