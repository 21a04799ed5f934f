use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store is offline")]
    Offline,

    #[error("remote operation timed out")]
    Timeout,

    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("subscription cancelled: {0}")]
    Cancelled(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl RemoteError {
    /// Whether a retry of the same operation can reasonably succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Offline | Self::Timeout | Self::Unavailable(_)
        )
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A remote record that does not conform to the wire schema.
///
/// Decoding is strict: a missing required field, an ill-typed field, or an
/// unknown status value all reject the whole record. Callers drop the record
/// and keep going; a malformed record must never poison local state.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has wrong type: {detail}")]
    WrongType {
        field: &'static str,
        detail: String,
    },

    #[error("unknown status value `{0}`")]
    UnknownStatus(String),

    #[error("record is not a JSON object")]
    NotAnObject,
}
