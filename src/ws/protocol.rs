//! Wire protocol for the location relay.
//!
//! Frames are UTF-8 text carrying `{"type": <string>, "payload": <object>}`.
//! Decoding is staged so the lifecycle handler can tell apart malformed
//! JSON, a broken envelope, an unknown type, and a bad payload for a known
//! type, and answer each with the right error code.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Machine-readable codes carried in `error` frames.
pub mod codes {
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const INVALID_MESSAGE_FORMAT: &str = "INVALID_MESSAGE_FORMAT";
    pub const INVALID_MESSAGE_TYPE: &str = "INVALID_MESSAGE_TYPE";
    pub const MISSING_FIELDS: &str = "MISSING_FIELDS";
    pub const AUTH_TIMEOUT: &str = "AUTH_TIMEOUT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinEvent {
        user_id: String,
        event_id: i64,
    },
    ShareLocation {
        latitude: f64,
        longitude: f64,
        timestamp: String,
        username: String,
    },
    LeaveEvent,
}

/// Messages the server sends. Every variant serializes; encoding is total.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    JoinSuccess {
        user_id: String,
        event_id: i64,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    LocationUpdate {
        user_id: String,
        username: String,
        latitude: f64,
        longitude: f64,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Wire form of this message.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Why an inbound frame failed to decode.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON at all.
    #[error("frame is not valid JSON: {0}")]
    Malformed(serde_json::Error),
    /// Valid JSON, but the `type`/`payload` envelope is broken
    /// (`message_type: None`), or the payload for a recognized type is
    /// missing a required field or carries one of the wrong type.
    #[error("frame does not match the type/payload envelope")]
    InvalidShape { message_type: Option<&'static str> },
    /// The envelope names a type the server does not recognize.
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinEventPayload {
    user_id: String,
    event_id: i64,
}

#[derive(Debug, Deserialize)]
struct ShareLocationPayload {
    latitude: f64,
    longitude: f64,
    timestamp: String,
    username: String,
}

/// Decode one inbound text frame into a client message.
pub fn decode(raw: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;

    let envelope = value
        .as_object()
        .ok_or(DecodeError::InvalidShape { message_type: None })?;
    let message_type = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::InvalidShape { message_type: None })?;
    let payload = envelope
        .get("payload")
        .filter(|p| p.is_object())
        .cloned()
        .ok_or(DecodeError::InvalidShape { message_type: None })?;

    match message_type {
        "join_event" => {
            let p: JoinEventPayload = serde_json::from_value(payload).map_err(|_| {
                DecodeError::InvalidShape {
                    message_type: Some("join_event"),
                }
            })?;
            Ok(ClientMessage::JoinEvent {
                user_id: p.user_id,
                event_id: p.event_id,
            })
        }
        "share_location" => {
            let p: ShareLocationPayload = serde_json::from_value(payload).map_err(|_| {
                DecodeError::InvalidShape {
                    message_type: Some("share_location"),
                }
            })?;
            Ok(ClientMessage::ShareLocation {
                latitude: p.latitude,
                longitude: p.longitude,
                timestamp: p.timestamp,
                username: p.username,
            })
        }
        "leave_event" => Ok(ClientMessage::LeaveEvent),
        other => Err(DecodeError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_join_event() {
        let msg = decode(r#"{"type":"join_event","payload":{"userId":"u1","eventId":42}}"#)
            .expect("valid join_event");
        assert_eq!(
            msg,
            ClientMessage::JoinEvent {
                user_id: "u1".to_string(),
                event_id: 42,
            }
        );
    }

    #[test]
    fn decodes_share_location() {
        let msg = decode(
            r#"{"type":"share_location","payload":{"latitude":36.0,"longitude":-78.9,"timestamp":"T","username":"Alice"}}"#,
        )
        .expect("valid share_location");
        assert_eq!(
            msg,
            ClientMessage::ShareLocation {
                latitude: 36.0,
                longitude: -78.9,
                timestamp: "T".to_string(),
                username: "Alice".to_string(),
            }
        );
    }

    #[test]
    fn decodes_leave_event_with_empty_payload() {
        let msg = decode(r#"{"type":"leave_event","payload":{}}"#).expect("valid leave_event");
        assert_eq!(msg, ClientMessage::LeaveEvent);
    }

    #[test]
    fn rejects_frames_that_are_not_json() {
        assert!(matches!(
            decode("definitely not json"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_envelopes_without_type_or_payload() {
        for raw in [
            r#"[1,2,3]"#,
            r#"{"payload":{}}"#,
            r#"{"type":"join_event"}"#,
            r#"{"type":42,"payload":{}}"#,
            r#"{"type":"join_event","payload":"flat"}"#,
        ] {
            assert!(
                matches!(
                    decode(raw),
                    Err(DecodeError::InvalidShape { message_type: None })
                ),
                "expected envelope rejection for {raw}"
            );
        }
    }

    #[test]
    fn rejects_join_event_missing_fields() {
        let err = decode(r#"{"type":"join_event","payload":{"userId":"u1"}}"#)
            .expect_err("eventId is required");
        assert!(matches!(
            err,
            DecodeError::InvalidShape {
                message_type: Some("join_event")
            }
        ));
    }

    #[test]
    fn rejects_join_event_with_wrong_field_types() {
        let err = decode(r#"{"type":"join_event","payload":{"userId":"u1","eventId":"42"}}"#)
            .expect_err("eventId must be an integer");
        assert!(matches!(
            err,
            DecodeError::InvalidShape {
                message_type: Some("join_event")
            }
        ));
    }

    #[test]
    fn rejects_share_location_missing_fields() {
        let err = decode(r#"{"type":"share_location","payload":{"latitude":36.0}}"#)
            .expect_err("payload is incomplete");
        assert!(matches!(
            err,
            DecodeError::InvalidShape {
                message_type: Some("share_location")
            }
        ));
    }

    #[test]
    fn rejects_unknown_message_types() {
        let err = decode(r#"{"type":"teleport","payload":{}}"#).expect_err("unknown type");
        match err {
            DecodeError::UnknownType(t) => assert_eq!(t, "teleport"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn encodes_join_success() {
        let frame = ServerMessage::JoinSuccess {
            user_id: "u1".to_string(),
            event_id: 42,
            message: "Successfully joined event 42".to_string(),
        }
        .to_frame();
        let value: serde_json::Value = serde_json::from_str(&frame).expect("frame is JSON");
        assert_eq!(
            value,
            json!({
                "type": "join_success",
                "payload": {
                    "userId": "u1",
                    "eventId": 42,
                    "message": "Successfully joined event 42",
                }
            })
        );
    }

    #[test]
    fn encodes_location_update() {
        let frame = ServerMessage::LocationUpdate {
            user_id: "u1".to_string(),
            username: "Alice".to_string(),
            latitude: 36.0,
            longitude: -78.9,
            timestamp: "T".to_string(),
        }
        .to_frame();
        let value: serde_json::Value = serde_json::from_str(&frame).expect("frame is JSON");
        assert_eq!(
            value,
            json!({
                "type": "location_update",
                "payload": {
                    "userId": "u1",
                    "username": "Alice",
                    "latitude": 36.0,
                    "longitude": -78.9,
                    "timestamp": "T",
                }
            })
        );
    }

    #[test]
    fn encodes_user_left_and_error() {
        let left: serde_json::Value = serde_json::from_str(
            &ServerMessage::UserLeft {
                user_id: "u1".to_string(),
            }
            .to_frame(),
        )
        .expect("frame is JSON");
        assert_eq!(
            left,
            json!({"type": "user_left", "payload": {"userId": "u1"}})
        );

        let error: serde_json::Value = serde_json::from_str(
            &ServerMessage::Error {
                code: codes::INVALID_JSON.to_string(),
                message: "bad frame".to_string(),
            }
            .to_frame(),
        )
        .expect("frame is JSON");
        assert_eq!(
            error,
            json!({"type": "error", "payload": {"code": "INVALID_JSON", "message": "bad frame"}})
        );
    }
}
