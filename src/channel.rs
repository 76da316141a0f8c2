//! Room channel adapter.
//!
//! Wraps the external event bus as a thin emit/deliver boundary: named
//! events with JSON payloads, scoped to one room. No decision logic lives
//! here; inbound frames are decoded and handed to the client, which routes
//! chat to the chat relay and call signaling to the call machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::calls::signaling::{InboundSignal, OutboundSignal};
use crate::chat::ChatMessage;

/// One frame on the room channel: a named event plus JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Frame for joining a room; membership only, no session effect.
    pub fn join_room(room: &str) -> Self {
        Self::new("join_room", Value::String(room.to_string()))
    }

    /// Frame for an outbound chat message.
    pub fn send_message(message: &ChatMessage) -> Result<Self, ChannelError> {
        let data = serde_json::to_value(message).map_err(|e| ChannelError::Payload {
            event: "send_message".to_string(),
            source: e,
        })?;
        Ok(Self::new("send_message", data))
    }

    /// Frame for an outbound call signal.
    pub fn signal(signal: &OutboundSignal) -> Result<Self, ChannelError> {
        let name = signal.name();
        let data = signal.payload().map_err(|e| ChannelError::Payload {
            event: name.wire_name().to_string(),
            source: e,
        })?;
        Ok(Self::new(name.wire_name(), data))
    }
}

/// Transport-level errors. Surfaced, never retried by the core; retry
/// policy belongs to the transport behind the adapter.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("malformed {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Emits outbound frames to the room. Implementations carry the actual
/// transport; inbound frames are delivered through whatever receiver the
/// implementation hands out at connect time.
#[async_trait]
pub trait RoomChannel: Send + Sync {
    async fn emit(&self, envelope: Envelope) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Inbound frames after decoding, ready for routing.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Server hello after the transport came up.
    Connected,
    RoomJoined { room: String },
    UserJoined { user_id: String },
    UserLeft { user_id: String },
    Message(ChatMessage),
    Signal(InboundSignal),
}

impl ChannelEvent {
    /// Decode an inbound frame. Returns `Ok(None)` for event names this
    /// client does not handle.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, ChannelError> {
        let payload_err = |e| ChannelError::Payload {
            event: envelope.event.clone(),
            source: e,
        };

        if let Some(decoded) = InboundSignal::decode(&envelope.event, &envelope.data) {
            let signal = decoded.map_err(payload_err)?;
            return Ok(Some(Self::Signal(signal)));
        }

        let event = match envelope.event.as_str() {
            "connected" => Self::Connected,
            "room_joined" => {
                // The relay sends either the bare room name or {room}.
                let room = match &envelope.data {
                    Value::String(room) => room.clone(),
                    data => serde_json::from_value::<RoomField>(data.clone())
                        .map_err(payload_err)?
                        .room,
                };
                Self::RoomJoined { room }
            }
            "user_joined" => {
                let p: UserPayload =
                    serde_json::from_value(envelope.data.clone()).map_err(payload_err)?;
                Self::UserJoined { user_id: p.user_id }
            }
            "user_left" => {
                let p: UserPayload =
                    serde_json::from_value(envelope.data.clone()).map_err(payload_err)?;
                Self::UserLeft { user_id: p.user_id }
            }
            "receive_message" => {
                let message: ChatMessage =
                    serde_json::from_value(envelope.data.clone()).map_err(payload_err)?;
                Self::Message(message)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Deserialize)]
struct RoomField {
    room: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::new("receive_message", json!({"room": "lobby"}));
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.event, "receive_message");
        assert_eq!(back.data["room"], "lobby");
    }

    #[test]
    fn test_envelope_data_defaults_to_null() {
        let back: Envelope = serde_json::from_str(r#"{"event":"connected"}"#).unwrap();
        assert!(back.data.is_null());
    }

    #[test]
    fn test_decode_chat_message() {
        let envelope = Envelope::new(
            "receive_message",
            json!({
                "room": "lobby",
                "message": "hi there",
                "author": "user-1",
                "time": "10:32",
            }),
        );
        match ChannelEvent::decode(&envelope).unwrap() {
            Some(ChannelEvent::Message(msg)) => {
                assert_eq!(msg.message, "hi there");
                assert_eq!(msg.author, "user-1");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_decode_routes_call_signals() {
        let envelope = Envelope::new("call_ended", json!({"from": "peer-1"}));
        assert!(matches!(
            ChannelEvent::decode(&envelope).unwrap(),
            Some(ChannelEvent::Signal(InboundSignal::CallEnded(_)))
        ));
    }

    #[test]
    fn test_decode_room_joined_accepts_both_shapes() {
        let bare = Envelope::new("room_joined", json!("lobby"));
        let wrapped = Envelope::new("room_joined", json!({"room": "lobby"}));
        for envelope in [bare, wrapped] {
            match ChannelEvent::decode(&envelope).unwrap() {
                Some(ChannelEvent::RoomJoined { room }) => assert_eq!(room, "lobby"),
                other => panic!("unexpected decode: {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_ignores_unknown_events() {
        let envelope = Envelope::new("typing_indicator", json!({}));
        assert!(ChannelEvent::decode(&envelope).unwrap().is_none());
    }

    #[test]
    fn test_decode_surfaces_malformed_payloads() {
        let envelope = Envelope::new("user_joined", json!({"wrong": true}));
        assert!(matches!(
            ChannelEvent::decode(&envelope),
            Err(ChannelError::Payload { .. })
        ));
    }
}
