//! Call signaling event names and payloads.
//!
//! Signaling travels over the room channel as named events with JSON
//! payloads. The names and payload shapes match what the relay expects;
//! see the table in the crate docs for direction and semantics.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::negotiation::{IceCandidate, SessionDescription};
use crate::media::MediaKind;

/// Named events used for call control on the room channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalName {
    CallUser,
    IncomingCall,
    AnswerCall,
    CallAccepted,
    IceCandidate,
    RejectCall,
    CallRejected,
    EndCall,
    CallEnded,
    CallFailed,
    CallError,
}

impl SignalName {
    /// The event name on the wire.
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::CallUser => "call_user",
            Self::IncomingCall => "incoming_call",
            Self::AnswerCall => "answer_call",
            Self::CallAccepted => "call_accepted",
            Self::IceCandidate => "ice_candidate",
            Self::RejectCall => "reject_call",
            Self::CallRejected => "call_rejected",
            Self::EndCall => "end_call",
            Self::CallEnded => "call_ended",
            Self::CallFailed => "call_failed",
            Self::CallError => "call_error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "call_user" => Self::CallUser,
            "incoming_call" => Self::IncomingCall,
            "answer_call" => Self::AnswerCall,
            "call_accepted" => Self::CallAccepted,
            "ice_candidate" => Self::IceCandidate,
            "reject_call" => Self::RejectCall,
            "call_rejected" => Self::CallRejected,
            "end_call" => Self::EndCall,
            "call_ended" => Self::CallEnded,
            "call_failed" => Self::CallFailed,
            "call_error" => Self::CallError,
            _ => return None,
        })
    }
}

impl fmt::Display for SignalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Caller → room: new session offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallUserPayload {
    pub room: String,
    pub offer: SessionDescription,
    #[serde(rename = "callType")]
    pub call_type: MediaKind,
}

/// Delivered to the callee when a peer starts a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingCallPayload {
    pub from: String,
    pub offer: SessionDescription,
    #[serde(rename = "callType")]
    pub call_type: MediaKind,
    pub room: String,
}

/// Callee → caller: the answer half of the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerCallPayload {
    pub room: String,
    pub answer: SessionDescription,
}

/// Delivered to the caller once the callee has answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAcceptedPayload {
    pub answer: SessionDescription,
    pub from: String,
}

/// Trickled either direction. Outbound carries `room`; inbound carries
/// `from` (the relay rewrites the envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub candidate: IceCandidate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Outbound reject/end events are scoped to the room only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room: String,
}

/// Inbound termination events name the peer and an optional reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReasonPayload {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Terminal error surfaced by the remote peer or the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Decoded inbound call-signaling events.
#[derive(Debug, Clone)]
pub enum InboundSignal {
    IncomingCall(IncomingCallPayload),
    CallAccepted(CallAcceptedPayload),
    IceCandidate(IceCandidatePayload),
    CallRejected(PeerReasonPayload),
    CallEnded(PeerReasonPayload),
    CallFailed(ErrorPayload),
    CallError(ErrorPayload),
}

impl InboundSignal {
    pub fn name(&self) -> SignalName {
        match self {
            Self::IncomingCall(_) => SignalName::IncomingCall,
            Self::CallAccepted(_) => SignalName::CallAccepted,
            Self::IceCandidate(_) => SignalName::IceCandidate,
            Self::CallRejected(_) => SignalName::CallRejected,
            Self::CallEnded(_) => SignalName::CallEnded,
            Self::CallFailed(_) => SignalName::CallFailed,
            Self::CallError(_) => SignalName::CallError,
        }
    }

    /// Decode a payload for a known inbound signal name. Returns `None`
    /// for names that are not call signaling (chat, membership).
    pub fn decode(name: &str, data: &serde_json::Value) -> Option<Result<Self, serde_json::Error>> {
        let signal = SignalName::from_wire(name)?;
        let decoded = match signal {
            SignalName::IncomingCall => {
                serde_json::from_value(data.clone()).map(Self::IncomingCall)
            }
            SignalName::CallAccepted => {
                serde_json::from_value(data.clone()).map(Self::CallAccepted)
            }
            SignalName::IceCandidate => {
                serde_json::from_value(data.clone()).map(Self::IceCandidate)
            }
            SignalName::CallRejected => {
                serde_json::from_value(data.clone()).map(Self::CallRejected)
            }
            SignalName::CallEnded => serde_json::from_value(data.clone()).map(Self::CallEnded),
            SignalName::CallFailed => serde_json::from_value(data.clone()).map(Self::CallFailed),
            SignalName::CallError => serde_json::from_value(data.clone()).map(Self::CallError),
            // Outbound-only names arriving inbound are not ours to handle.
            SignalName::CallUser
            | SignalName::AnswerCall
            | SignalName::RejectCall
            | SignalName::EndCall => return None,
        };
        Some(decoded)
    }
}

/// Outbound call-signaling events, encoded by the machine before emission.
#[derive(Debug, Clone)]
pub enum OutboundSignal {
    CallUser(CallUserPayload),
    AnswerCall(AnswerCallPayload),
    IceCandidate(IceCandidatePayload),
    RejectCall(RoomPayload),
    EndCall(RoomPayload),
    CallError(ErrorPayload),
}

impl OutboundSignal {
    pub fn name(&self) -> SignalName {
        match self {
            Self::CallUser(_) => SignalName::CallUser,
            Self::AnswerCall(_) => SignalName::AnswerCall,
            Self::IceCandidate(_) => SignalName::IceCandidate,
            Self::RejectCall(_) => SignalName::RejectCall,
            Self::EndCall(_) => SignalName::EndCall,
            Self::CallError(_) => SignalName::CallError,
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::CallUser(p) => serde_json::to_value(p),
            Self::AnswerCall(p) => serde_json::to_value(p),
            Self::IceCandidate(p) => serde_json::to_value(p),
            Self::RejectCall(p) => serde_json::to_value(p),
            Self::EndCall(p) => serde_json::to_value(p),
            Self::CallError(p) => serde_json::to_value(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_name_round_trip() {
        for name in [
            SignalName::CallUser,
            SignalName::IncomingCall,
            SignalName::AnswerCall,
            SignalName::CallAccepted,
            SignalName::IceCandidate,
            SignalName::RejectCall,
            SignalName::CallRejected,
            SignalName::EndCall,
            SignalName::CallEnded,
            SignalName::CallFailed,
            SignalName::CallError,
        ] {
            assert_eq!(SignalName::from_wire(name.wire_name()), Some(name));
        }
        assert_eq!(SignalName::from_wire("send_message"), None);
    }

    #[test]
    fn test_decode_incoming_call() {
        let data = json!({
            "from": "peer-1",
            "offer": {"type": "offer", "sdp": "v=0\r\n"},
            "callType": "video",
            "room": "lobby",
        });
        let signal = InboundSignal::decode("incoming_call", &data)
            .expect("call signal")
            .expect("well formed");
        match signal {
            InboundSignal::IncomingCall(p) => {
                assert_eq!(p.from, "peer-1");
                assert_eq!(p.call_type, MediaKind::Video);
                assert_eq!(p.room, "lobby");
            }
            other => panic!("unexpected signal: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let result = InboundSignal::decode("call_accepted", &json!({"answer": 42}));
        assert!(matches!(result, Some(Err(_))));
    }

    #[test]
    fn test_decode_ignores_chat_events() {
        assert!(InboundSignal::decode("receive_message", &json!({})).is_none());
    }

    #[test]
    fn test_reason_is_optional_on_call_ended() {
        let p: PeerReasonPayload = serde_json::from_value(json!({"from": "peer-1"})).unwrap();
        assert_eq!(p.reason, None);
    }

    #[test]
    fn test_outbound_call_user_shape() {
        let out = OutboundSignal::CallUser(CallUserPayload {
            room: "lobby".into(),
            offer: SessionDescription::offer("v=0\r\n"),
            call_type: MediaKind::Audio,
        });
        assert_eq!(out.name().wire_name(), "call_user");
        let payload = out.payload().unwrap();
        assert_eq!(payload["callType"], "audio");
        assert_eq!(payload["offer"]["type"], "offer");
    }
}
