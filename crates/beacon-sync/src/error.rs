use thiserror::Error;

use beacon_remote::RemoteError;

/// Why an operation was rejected before any state changed.
///
/// Validation failures are synchronous and final: nothing is written locally,
/// nothing is queued, and nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("recipient has blocked this user")]
    Blocked,

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("cannot open a conversation with yourself")]
    SelfMessage,

    #[error("message text is empty")]
    EmptyMessage,

    #[error("a conversation needs at least one other participant")]
    NoParticipants,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// No signed-in user. Sync operations are no-ops without one.
    #[error("no signed-in user")]
    NoIdentity,

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("local store error: {0}")]
    Store(String),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("unknown message: {0}")]
    UnknownMessage(String),
}

impl From<tokio_rusqlite::Error> for SyncError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}
