//! Subscription lifecycle.
//!
//! Owns every reconciler feed task and enforces at most one per key.
//! Starting an already-running feed is a no-op; stopping one that is not
//! running is a no-op; stop returns only after the task has exited, so a
//! caller observing a completed stop knows no further merges will land.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::reconciler;
use crate::state::EngineState;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FeedKey {
    ConversationList,
    Messages(String),
}

impl FeedKey {
    fn describe(&self) -> String {
        match self {
            Self::ConversationList => "conversation list".to_string(),
            Self::Messages(id) => format!("messages of {id}"),
        }
    }
}

struct FeedHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ListenerManager {
    ctx: Arc<EngineState>,
    feeds: Mutex<HashMap<FeedKey, FeedHandle>>,
}

impl ListenerManager {
    pub(crate) fn new(ctx: Arc<EngineState>) -> Self {
        Self {
            ctx,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn start_message_feed(&self, conversation_id: &str) {
        self.start(FeedKey::Messages(conversation_id.to_string()));
    }

    pub(crate) async fn stop_message_feed(&self, conversation_id: &str) {
        self.stop(&FeedKey::Messages(conversation_id.to_string()))
            .await;
    }

    pub(crate) fn start_conversation_list_feed(&self) {
        self.start(FeedKey::ConversationList);
    }

    pub(crate) async fn stop_conversation_list_feed(&self) {
        self.stop(&FeedKey::ConversationList).await;
    }

    /// Stop every feed. Used at engine shutdown.
    pub(crate) async fn stop_all(&self) {
        let drained: Vec<(FeedKey, FeedHandle)> = self.feeds.lock().drain().collect();
        for (key, feed) in drained {
            tracing::info!(feed = %key.describe(), "stopping listener");
            halt(feed).await;
        }
    }

    fn start(&self, key: FeedKey) {
        let mut feeds = self.feeds.lock();
        if let Some(existing) = feeds.get(&key) {
            if existing.handle.is_finished() {
                // The feed died on its own (remote cancellation); replace it.
                feeds.remove(&key);
            } else {
                tracing::debug!(feed = %key.describe(), "listener already running");
                return;
            }
        }

        tracing::info!(feed = %key.describe(), "starting listener");
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let handle = match &key {
            FeedKey::ConversationList => tokio::spawn(reconciler::run_conversation_list_feed(
                self.ctx.clone(),
                shutdown_rx,
            )),
            FeedKey::Messages(conversation_id) => tokio::spawn(reconciler::run_message_feed(
                self.ctx.clone(),
                conversation_id.clone(),
                shutdown_rx,
            )),
        };
        feeds.insert(
            key,
            FeedHandle {
                shutdown_tx,
                handle,
            },
        );
    }

    async fn stop(&self, key: &FeedKey) {
        let Some(feed) = self.feeds.lock().remove(key) else {
            tracing::debug!(feed = %key.describe(), "listener not running");
            return;
        };
        tracing::info!(feed = %key.describe(), "stopping listener");
        halt(feed).await;
    }
}

async fn halt(feed: FeedHandle) {
    let _ = feed.shutdown_tx.send(()).await;
    let _ = feed.handle.await;
}
