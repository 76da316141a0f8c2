//! Negotiation engine adapter.
//!
//! Wraps the opaque media-negotiation primitive behind a trait: it produces
//! and consumes session descriptions and connectivity candidates, and it
//! reports connection-state changes and inbound media back to the call
//! machine. One engine instance exists per call session and is owned
//! exclusively by it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{MediaHandle, MediaKind};

/// Which half of the offer/answer exchange a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// The negotiated capability/media description exchanged as offer/answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled network-reachability hint used to establish the
/// peer-to-peer transport path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string (e.g. "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}

/// Transport-path state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that end the session when reported.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// An inbound media stream surfaced by the engine once connected.
/// Opaque to the call machine; the UI layer attaches it for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Events delivered asynchronously by the engine.
///
/// These are fed into the call machine's serialized event queue, never
/// applied to session state from the engine's own call stacks.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local candidate to trickle to the peer immediately, never batched.
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("engine construction failed: {0}")]
    Construction(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("engine closed")]
    Closed,
}

/// Contract for one session's negotiation engine.
///
/// Sequencing rules enforced by the caller (the call machine):
/// `set_local_description` and `set_remote_description` are each called at
/// most once per session; local media is attached before
/// `set_remote_description` so the resulting description advertises the
/// session's capabilities; `add_remote_candidate` is never called before
/// `set_remote_description` has completed. `close` is idempotent and is
/// called exactly once by the termination path.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_offer(&self, want_video: bool) -> Result<SessionDescription, NegotiationError>;

    /// Only valid after a remote offer has been applied.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn attach_media(&self, handle: Arc<dyn MediaHandle>) -> Result<(), NegotiationError>;

    async fn close(&self);
}

/// Creates one engine per session. Engine events flow through the supplied
/// sender into the call machine's queue.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        stun_servers: &[String],
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError>;
}

/// Factory for deployments without a real negotiation primitive: every
/// call attempt fails cleanly instead of dangling.
#[derive(Debug, Default)]
pub struct DisabledEngineFactory;

#[async_trait]
impl EngineFactory for DisabledEngineFactory {
    async fn create(
        &self,
        _stun_servers: &[String],
        _events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        Err(NegotiationError::Construction(
            "negotiation engine unavailable".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_builder() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment("abc123");

        assert!(candidate.candidate.starts_with("candidate:"));
        assert_eq!(candidate.sdp_mid, Some("0".to_string()));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.username_fragment, Some("abc123".to_string()));
    }

    #[test]
    fn test_description_wire_shape() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");

        let back: SessionDescription = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, SdpKind::Offer);
    }

    #[test]
    fn test_candidate_omits_absent_fields() {
        let json = serde_json::to_value(IceCandidate::new("candidate:1")).unwrap();
        assert!(json.get("sdpMid").is_none());
        assert!(json.get("sdpMLineIndex").is_none());
    }

    #[test]
    fn test_terminal_connection_states() {
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
    }
}
