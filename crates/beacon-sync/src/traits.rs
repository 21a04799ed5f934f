//! Collaborator seams.
//!
//! The engine stays agnostic of account management, contact policy, and UI
//! notification plumbing; hosts plug those in through these traits. Each has
//! a trivial default implementation for tests and headless use.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::ValidationError;

/// Source of the signed-in user id.
///
/// Consulted at the start of every operation that writes; when it returns
/// `None` the operation becomes a logged no-op instead of an error surfaced
/// to the user.
pub trait Identity: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// An [`Identity`] holding a swappable user id. Covers hosts without an
/// account system and tests that flip sign-in state mid-run.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user_id: RwLock<Option<String>>,
}

impl StaticIdentity {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: Option<String>) {
        *self.user_id.write() = user_id;
    }
}

impl Identity for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }
}

/// Decides whether a sender may start a conversation with (or message) the
/// given recipients. Runs before anything is persisted, so a denial leaves
/// no trace in the replica.
#[async_trait]
pub trait RecipientPolicy: Send + Sync {
    async fn check(&self, sender_id: &str, recipient_ids: &[String])
        -> Result<(), ValidationError>;
}

/// Policy that accepts everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl RecipientPolicy for AllowAll {
    async fn check(
        &self,
        _sender_id: &str,
        _recipient_ids: &[String],
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Facts about an incoming message, for the host's notification layer.
/// Carries the sender id rather than a display name; resolving names is the
/// host's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageNotification {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub body: String,
    /// `true` when the message predates the current subscription, i.e. it
    /// was caught up rather than received live. Hosts typically suppress
    /// banners and sounds for these.
    pub is_historical: bool,
}

/// Sink for incoming-message notifications. Called after the message is
/// durably merged, once per merged message, never for the user's own.
pub trait Notifier: Send + Sync {
    fn message_merged(&self, note: &MessageNotification);
}

/// Notifier that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn message_merged(&self, _note: &MessageNotification) {}
}
