//! Typed locations in the remote store tree.
//!
//! The store is a hierarchy with two top-level areas: conversation records
//! under `/conversations/{id}` and message records under
//! `/messages/{conversationID}/{messageID}`. Call sites build paths through
//! these constructors rather than formatting strings, so a malformed location
//! is unrepresentable.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemotePath {
    /// The `/conversations` collection.
    Conversations,
    /// A single conversation record, `/conversations/{id}`.
    Conversation(String),
    /// The message collection of one conversation, `/messages/{conversationID}`.
    ConversationMessages(String),
    /// A single message record, `/messages/{conversationID}/{messageID}`.
    Message {
        conversation_id: String,
        message_id: String,
    },
}

impl RemotePath {
    pub fn conversation(id: impl Into<String>) -> Self {
        Self::Conversation(id.into())
    }

    pub fn conversation_messages(conversation_id: impl Into<String>) -> Self {
        Self::ConversationMessages(conversation_id.into())
    }

    pub fn message(conversation_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::Message {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
        }
    }

    /// Whether this path names a collection of child records.
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Conversations | Self::ConversationMessages(_))
    }

    /// The collection containing this record, if it is a record path.
    pub fn parent(&self) -> Option<RemotePath> {
        match self {
            Self::Conversations | Self::ConversationMessages(_) => None,
            Self::Conversation(_) => Some(Self::Conversations),
            Self::Message {
                conversation_id, ..
            } => Some(Self::ConversationMessages(conversation_id.clone())),
        }
    }

    /// The record path for `key` under this collection.
    pub fn child(&self, key: &str) -> Option<RemotePath> {
        match self {
            Self::Conversations => Some(Self::Conversation(key.to_string())),
            Self::ConversationMessages(cid) => Some(Self::Message {
                conversation_id: cid.clone(),
                message_id: key.to_string(),
            }),
            _ => None,
        }
    }

    /// The final path segment (the record key, or the collection name).
    pub fn key(&self) -> &str {
        match self {
            Self::Conversations => "conversations",
            Self::Conversation(id) => id,
            Self::ConversationMessages(cid) => cid,
            Self::Message { message_id, .. } => message_id,
        }
    }

    /// Path segments from the root, in order.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Conversations => vec!["conversations"],
            Self::Conversation(id) => vec!["conversations", id],
            Self::ConversationMessages(cid) => vec!["messages", cid],
            Self::Message {
                conversation_id,
                message_id,
            } => vec!["messages", conversation_id, message_id],
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments().join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_slash_separated_segments() {
        assert_eq!(RemotePath::Conversations.to_string(), "/conversations");
        assert_eq!(
            RemotePath::conversation("a_b").to_string(),
            "/conversations/a_b"
        );
        assert_eq!(
            RemotePath::conversation_messages("a_b").to_string(),
            "/messages/a_b"
        );
        assert_eq!(
            RemotePath::message("a_b", "m1").to_string(),
            "/messages/a_b/m1"
        );
    }

    #[test]
    fn parent_and_child_round_trip() {
        let msg = RemotePath::message("conv", "m1");
        let parent = msg.parent().unwrap();
        assert_eq!(parent, RemotePath::conversation_messages("conv"));
        assert_eq!(parent.child("m1").unwrap(), msg);

        let conv = RemotePath::conversation("conv");
        assert_eq!(conv.parent().unwrap(), RemotePath::Conversations);
        assert_eq!(RemotePath::Conversations.child("conv").unwrap(), conv);
    }

    #[test]
    fn collections_have_no_parent_and_records_no_children() {
        assert!(RemotePath::Conversations.parent().is_none());
        assert!(RemotePath::conversation_messages("c").parent().is_none());
        assert!(RemotePath::conversation("c").child("x").is_none());
        assert!(RemotePath::message("c", "m").child("x").is_none());
    }

    #[test]
    fn collection_flag_matches_variant() {
        assert!(RemotePath::Conversations.is_collection());
        assert!(RemotePath::conversation_messages("c").is_collection());
        assert!(!RemotePath::conversation("c").is_collection());
        assert!(!RemotePath::message("c", "m").is_collection());
    }
}
