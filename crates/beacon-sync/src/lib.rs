//! Offline-first conversation and message synchronization.
//!
//! The engine keeps a durable SQLite replica of a remote realtime store
//! (conversations and their messages), writes locally first, and reconciles
//! both directions in the background:
//!
//! * outbound — every local mutation is queued durably in the same
//!   transaction that applies it, then delivered FIFO per conversation with
//!   retry and backoff;
//! * inbound — per-conversation feeds merge remote snapshots and live
//!   events into the replica, idempotently and with monotonic delivery
//!   status.
//!
//! [`engine::SyncEngine`] is the entry point; everything else is plumbing
//! it composes.

pub mod config;
pub mod conversation_repo;
pub mod db;
pub mod db_helpers;
pub mod engine;
pub mod error;
pub mod events;
pub mod message_repo;
pub mod model;
pub mod outbox_repo;
pub mod services;
pub mod state;
pub mod status;
pub mod traits;

pub use config::SyncConfig;
pub use db::{create_pool, DbOpenResult, DbPool};
pub use engine::SyncEngine;
pub use error::{SyncError, ValidationError};
pub use events::{EventReceiver, StoreEvent};
pub use model::{
    canonical_participants, direct_conversation_id, Conversation, Message, MutationPayload,
    OutboundMutation, SyncStatus,
};
pub use status::DeliveryStatus;
pub use traits::{
    AllowAll, Identity, MessageNotification, Notifier, NullNotifier, RecipientPolicy,
    StaticIdentity,
};
