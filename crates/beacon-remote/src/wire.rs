//! Wire records exchanged with the remote store.
//!
//! Decoding is strict (`from_value`): a record that is missing a required
//! field, carries an ill-typed field, or names an unknown status is rejected
//! whole with a [`DecodeError`]. Unknown extra fields are tolerated — the
//! remote side may add fields over time. Nothing is silently defaulted.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::DecodeError;

/// Key marking a server-substituted value, e.g. `{".sv": "timestamp"}`.
pub const SERVER_VALUE_KEY: &str = ".sv";
/// Sentinel name for the authoritative commit timestamp (ms).
pub const SV_TIMESTAMP: &str = "timestamp";
/// Sentinel name for the per-collection monotonic child counter.
pub const SV_SEQUENCE: &str = "sequence";

/// Placeholder the store replaces with its clock at commit time.
pub fn timestamp_sentinel() -> Value {
    json!({ SERVER_VALUE_KEY: SV_TIMESTAMP })
}

/// Placeholder the store replaces with the next per-collection counter.
pub fn sequence_sentinel() -> Value {
    json!({ SERVER_VALUE_KEY: SV_SEQUENCE })
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Delivery status as it appears on the wire.
///
/// Only remotely-meaningful states travel; the local-only pending and failed
/// states never appear in a remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    Sent,
    Delivered,
    Read,
}

impl WireStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(DecodeError::UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A message record as stored under `/messages/{conversationID}/{messageID}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    /// Authoritative commit time (ms), substituted by the store.
    pub server_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    pub status: WireStatus,
}

impl WireMessage {
    /// Strictly decode a remote record.
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let map = obj(value)?;
        Ok(Self {
            id: req_id(map, "id")?,
            conversation_id: req_id(map, "conversationId")?,
            sender_id: req_id(map, "senderId")?,
            text: req_str(map, "text")?,
            server_timestamp: req_i64(map, "serverTimestamp")?,
            sequence_number: opt_i64(map, "sequenceNumber")?,
            status: WireStatus::parse(&req_str(map, "status")?)?,
        })
    }

    /// Build the value a client writes when sending a message.
    ///
    /// The server timestamp and sequence number are written as sentinels; the
    /// store substitutes both at commit, so the echoed record decodes with
    /// concrete values.
    pub fn outgoing(
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
        status: WireStatus,
    ) -> Value {
        json!({
            "id": id,
            "conversationId": conversation_id,
            "senderId": sender_id,
            "text": text,
            "serverTimestamp": timestamp_sentinel(),
            "sequenceNumber": sequence_sentinel(),
            "status": status.as_str(),
        })
    }
}

/// A conversation record as stored under `/conversations/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConversation {
    pub id: String,
    /// Canonically sorted participant ids.
    pub participant_ids: Vec<String>,
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_timestamp: Option<i64>,
}

impl WireConversation {
    /// Strictly decode a remote record.
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let map = obj(value)?;
        Ok(Self {
            id: req_id(map, "id")?,
            participant_ids: str_array(map, "participantIds")?,
            is_group: req_bool(map, "isGroup")?,
            display_name: opt_str(map, "displayName")?,
            photo_ref: opt_str(map, "photoRef")?,
            created_at: req_i64(map, "createdAt")?,
            updated_at: req_i64(map, "updatedAt")?,
            last_message: opt_str(map, "lastMessage")?,
            last_message_timestamp: opt_i64(map, "lastMessageTimestamp")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

fn obj(value: &Value) -> Result<&Map<String, Value>, DecodeError> {
    value.as_object().ok_or(DecodeError::NotAnObject)
}

fn req_str(map: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(wrong_type(field, other)),
    }
}

/// Like [`req_str`] but additionally rejects the empty string — an empty id
/// would break id-keyed merging downstream.
fn req_id(map: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    let s = req_str(map, field)?;
    if s.is_empty() {
        return Err(DecodeError::WrongType {
            field,
            detail: "empty string".to_string(),
        });
    }
    Ok(s)
}

fn opt_str(map: &Map<String, Value>, field: &'static str) -> Result<Option<String>, DecodeError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(wrong_type(field, other)),
    }
}

fn req_i64(map: &Map<String, Value>, field: &'static str) -> Result<i64, DecodeError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(v) => v.as_i64().ok_or_else(|| wrong_type(field, v)),
    }
}

fn opt_i64(map: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, DecodeError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| wrong_type(field, v)),
    }
}

fn req_bool(map: &Map<String, Value>, field: &'static str) -> Result<bool, DecodeError> {
    match map.get(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(wrong_type(field, other)),
    }
}

fn str_array(map: &Map<String, Value>, field: &'static str) -> Result<Vec<String>, DecodeError> {
    let arr = match map.get(field) {
        None | Some(Value::Null) => return Err(DecodeError::MissingField(field)),
        Some(Value::Array(a)) => a,
        Some(other) => return Err(wrong_type(field, other)),
    };
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        match v {
            Value::String(s) if !s.is_empty() => out.push(s.clone()),
            _ => return Err(wrong_type(field, v)),
        }
    }
    Ok(out)
}

fn wrong_type(field: &'static str, value: &Value) -> DecodeError {
    let detail = match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    DecodeError::WrongType {
        field,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_message() -> Value {
        json!({
            "id": "m1",
            "conversationId": "a_b",
            "senderId": "a",
            "text": "hello",
            "serverTimestamp": 1_700_000_000_000_i64,
            "sequenceNumber": 7,
            "status": "sent",
        })
    }

    #[test]
    fn decodes_a_complete_message() {
        let msg = WireMessage::from_value(&full_message()).unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.conversation_id, "a_b");
        assert_eq!(msg.sender_id, "a");
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.server_timestamp, 1_700_000_000_000);
        assert_eq!(msg.sequence_number, Some(7));
        assert_eq!(msg.status, WireStatus::Sent);
    }

    #[test]
    fn sequence_number_is_optional() {
        let mut v = full_message();
        v.as_object_mut().unwrap().remove("sequenceNumber");
        let msg = WireMessage::from_value(&v).unwrap();
        assert_eq!(msg.sequence_number, None);
    }

    #[test]
    fn tolerates_unknown_extra_fields() {
        let mut v = full_message();
        v.as_object_mut()
            .unwrap()
            .insert("reactions".into(), json!({"a": "👍"}));
        assert!(WireMessage::from_value(&v).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        for field in ["id", "conversationId", "senderId", "text", "serverTimestamp", "status"] {
            let mut v = full_message();
            v.as_object_mut().unwrap().remove(field);
            let err = WireMessage::from_value(&v).unwrap_err();
            assert!(
                matches!(err, DecodeError::MissingField(f) if f == field),
                "expected MissingField({field}), got {err:?}"
            );
        }
    }

    #[test]
    fn rejects_ill_typed_fields() {
        let mut v = full_message();
        v.as_object_mut()
            .unwrap()
            .insert("serverTimestamp".into(), json!("yesterday"));
        assert!(matches!(
            WireMessage::from_value(&v),
            Err(DecodeError::WrongType { field: "serverTimestamp", .. })
        ));

        let mut v = full_message();
        v.as_object_mut()
            .unwrap()
            .insert("serverTimestamp".into(), json!(12.5));
        assert!(WireMessage::from_value(&v).is_err());

        let mut v = full_message();
        v.as_object_mut().unwrap().insert("text".into(), json!(42));
        assert!(matches!(
            WireMessage::from_value(&v),
            Err(DecodeError::WrongType { field: "text", .. })
        ));
    }

    #[test]
    fn rejects_unknown_status() {
        let mut v = full_message();
        v.as_object_mut()
            .unwrap()
            .insert("status".into(), json!("archived"));
        assert!(matches!(
            WireMessage::from_value(&v),
            Err(DecodeError::UnknownStatus(s)) if s == "archived"
        ));
    }

    #[test]
    fn rejects_empty_ids_and_non_objects() {
        let mut v = full_message();
        v.as_object_mut().unwrap().insert("id".into(), json!(""));
        assert!(WireMessage::from_value(&v).is_err());

        assert!(matches!(
            WireMessage::from_value(&json!("not a record")),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[test]
    fn outgoing_message_carries_sentinels() {
        let v = WireMessage::outgoing("m1", "a_b", "a", "hi", WireStatus::Sent);
        assert_eq!(v["serverTimestamp"], timestamp_sentinel());
        assert_eq!(v["sequenceNumber"], sequence_sentinel());
        assert_eq!(v["status"], json!("sent"));
        // Unsubstituted sentinels must not decode as a valid record.
        assert!(WireMessage::from_value(&v).is_err());
    }

    #[test]
    fn decodes_a_conversation_and_rejects_bad_participants() {
        let v = json!({
            "id": "a_b",
            "participantIds": ["a", "b"],
            "isGroup": false,
            "createdAt": 1,
            "updatedAt": 2,
        });
        let conv = WireConversation::from_value(&v).unwrap();
        assert_eq!(conv.participant_ids, vec!["a", "b"]);
        assert!(!conv.is_group);
        assert_eq!(conv.display_name, None);
        assert_eq!(conv.last_message, None);

        let v = json!({
            "id": "a_b",
            "participantIds": ["a", 7],
            "isGroup": false,
            "createdAt": 1,
            "updatedAt": 2,
        });
        assert!(matches!(
            WireConversation::from_value(&v),
            Err(DecodeError::WrongType { field: "participantIds", .. })
        ));
    }

    #[test]
    fn serialized_message_round_trips_through_strict_decode() {
        let msg = WireMessage {
            id: "m9".into(),
            conversation_id: "a_b".into(),
            sender_id: "b".into(),
            text: "round trip".into(),
            server_timestamp: 99,
            sequence_number: None,
            status: WireStatus::Read,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(WireMessage::from_value(&v).unwrap(), msg);
    }
}
