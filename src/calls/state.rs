//! Call session state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::negotiation::{IceCandidate, SessionDescription};
use crate::media::{MediaFlags, MediaKind};

/// Which side of the offer/answer exchange this session is.
///
/// Set at session creation and never changed: callers only ever send
/// offers, callees only ever send answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local hang-up.
    HungUp,
    /// Local decline of a ringing call.
    Declined,
    /// Peer sent `call_ended`.
    RemoteEnded(Option<String>),
    /// Peer sent `call_rejected`.
    RemoteDeclined(Option<String>),
    /// Peer or relay surfaced `call_failed`/`call_error`.
    RemoteFailed(String),
    /// The negotiation engine reported a dead transport path.
    ConnectionLost,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HungUp => f.write_str("call ended"),
            Self::Declined => f.write_str("call declined"),
            Self::RemoteEnded(Some(reason)) => f.write_str(reason),
            Self::RemoteEnded(None) => f.write_str("call ended by peer"),
            Self::RemoteDeclined(Some(reason)) => f.write_str(reason),
            Self::RemoteDeclined(None) => f.write_str("call rejected"),
            Self::RemoteFailed(message) => f.write_str(message),
            Self::ConnectionLost => f.write_str("connection failed"),
        }
    }
}

/// Current state of the call session.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// No session in progress.
    #[default]
    Idle,
    /// Waiting for local capture before negotiating.
    AwaitingMedia,
    /// Caller: building the offer, nothing on the wire yet.
    Offering,
    /// Caller: offer delivered, remote side is ringing.
    RingingRemote { offer_sent_at: DateTime<Utc> },
    /// Callee: ringing locally with a stored remote offer.
    RingingLocal { received_at: DateTime<Utc> },
    /// Callee: applying the offer and producing the answer.
    Answering,
    /// Both descriptions set, waiting for media to flow.
    Connecting { accepted_at: DateTime<Utc> },
    /// First remote track observed, call is live.
    Active { connected_at: DateTime<Utc> },
    /// Termination in progress, resources being released.
    Ending {
        reason: EndReason,
        connected_at: Option<DateTime<Utc>>,
    },
    /// Terminal: released cleanly.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
    /// Terminal: unrecoverable local error.
    Failed { ended_at: DateTime<Utc> },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::RingingRemote { .. } | Self::RingingLocal { .. })
    }

    pub fn is_ending(&self) -> bool {
        matches!(self, Self::Ending { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Failed { .. })
    }

    pub fn can_answer(&self) -> bool {
        matches!(self, Self::RingingLocal { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::RingingLocal { .. })
    }

    /// Transient status text shown by the UI layer.
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::Idle => "",
            Self::AwaitingMedia => "Accessing camera/microphone...",
            Self::Offering => "Starting call...",
            Self::RingingRemote { .. } => "Calling...",
            Self::RingingLocal { .. } => "Incoming call...",
            Self::Answering => "Answering call...",
            Self::Connecting { .. } => "Call connected",
            Self::Active { .. } => "Call active",
            Self::Ending { .. } => "Call ended",
            Self::Ended { .. } => "Call ended",
            Self::Failed { .. } => "Call failed",
        }
    }
}

/// State transitions applied by the call machine.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local capture acquired; role decides the next phase.
    MediaReady,
    /// The offer left on the wire.
    OfferSent,
    /// The callee accepted our answer intent locally.
    LocalAnswered,
    /// The answer left on the wire.
    AnswerSent,
    /// The remote answer was applied.
    RemoteAccepted,
    /// First inbound remote track observed.
    MediaFlowing,
    /// Any termination cause; enters the release sequence.
    BeginTermination { reason: EndReason },
    /// Release sequence finished cleanly.
    Finished,
    /// Unrecoverable local error.
    MarkFailed,
}

/// The single authoritative record of an in-progress or pending call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    /// Monotonic identity used to discard async results that resumed
    /// after this session was replaced or torn down.
    pub epoch: u64,
    pub room: String,
    /// Known once an offer or answer referencing the peer is seen.
    pub peer: Option<String>,
    pub kind: MediaKind,
    pub role: CallRole,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub local_description: Option<SessionDescription>,
    #[serde(skip)]
    pub remote_description: Option<SessionDescription>,
    /// Candidates received before the remote description was set; drained
    /// in receipt order the moment it is.
    #[serde(skip)]
    pub pending_remote_candidates: Vec<IceCandidate>,
    /// Callee only: the offer stored at ring time, applied when answering.
    #[serde(skip)]
    pub stored_offer: Option<SessionDescription>,
    pub media_flags: MediaFlags,
    /// Whether the peer has been told this session exists. Failures after
    /// this point must be signaled so the peer does not dangle.
    pub peer_notified: bool,
    pub last_error: Option<String>,
}

impl CallSession {
    pub fn new_caller(epoch: u64, room: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            epoch,
            room: room.into(),
            peer: None,
            kind,
            role: CallRole::Caller,
            state: CallState::AwaitingMedia,
            created_at: Utc::now(),
            local_description: None,
            remote_description: None,
            pending_remote_candidates: Vec::new(),
            stored_offer: None,
            media_flags: MediaFlags::default(),
            peer_notified: false,
            last_error: None,
        }
    }

    pub fn new_callee(
        epoch: u64,
        room: impl Into<String>,
        peer: impl Into<String>,
        kind: MediaKind,
        offer: SessionDescription,
    ) -> Self {
        Self {
            epoch,
            room: room.into(),
            peer: Some(peer.into()),
            kind,
            role: CallRole::Callee,
            state: CallState::RingingLocal {
                received_at: Utc::now(),
            },
            created_at: Utc::now(),
            local_description: None,
            remote_description: None,
            pending_remote_candidates: Vec::new(),
            stored_offer: Some(offer),
            media_flags: MediaFlags::default(),
            // The caller initiated, so it must always learn how this ends.
            peer_notified: true,
            last_error: None,
        }
    }

    /// Apply a state transition. Returns an error if the transition is not
    /// in the table; fields are never silently overwritten.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::AwaitingMedia, CallTransition::MediaReady) => match self.role {
                CallRole::Caller => CallState::Offering,
                CallRole::Callee => CallState::Answering,
            },
            (CallState::Offering, CallTransition::OfferSent) => CallState::RingingRemote {
                offer_sent_at: Utc::now(),
            },
            (CallState::RingingRemote { .. }, CallTransition::RemoteAccepted) => {
                CallState::Connecting {
                    accepted_at: Utc::now(),
                }
            }
            (CallState::RingingLocal { .. }, CallTransition::LocalAnswered) => {
                CallState::AwaitingMedia
            }
            (CallState::Answering, CallTransition::AnswerSent) => CallState::Connecting {
                accepted_at: Utc::now(),
            },
            (CallState::Connecting { .. }, CallTransition::MediaFlowing) => CallState::Active {
                connected_at: Utc::now(),
            },
            (CallState::Active { connected_at }, CallTransition::BeginTermination { reason }) => {
                CallState::Ending {
                    reason,
                    connected_at: Some(*connected_at),
                }
            }
            (
                CallState::AwaitingMedia
                | CallState::Offering
                | CallState::RingingRemote { .. }
                | CallState::RingingLocal { .. }
                | CallState::Answering
                | CallState::Connecting { .. },
                CallTransition::BeginTermination { reason },
            ) => CallState::Ending {
                reason,
                connected_at: None,
            },
            (
                CallState::Ending {
                    reason,
                    connected_at,
                },
                CallTransition::Finished,
            ) => {
                let ended_at = Utc::now();
                let duration_secs =
                    (*connected_at).map(|t| ended_at.signed_duration_since(t).num_seconds());
                CallState::Ended {
                    reason: reason.clone(),
                    ended_at,
                    duration_secs,
                }
            }
            (
                CallState::AwaitingMedia
                | CallState::Offering
                | CallState::RingingRemote { .. }
                | CallState::RingingLocal { .. }
                | CallState::Answering
                | CallState::Connecting { .. }
                | CallState::Active { .. }
                | CallState::Ending { .. },
                CallTransition::MarkFailed,
            ) => CallState::Failed {
                ended_at: Utc::now(),
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }

    /// Record the local description. Set at most once per session.
    pub fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), InvalidTransition> {
        if self.local_description.is_some() {
            return Err(InvalidTransition {
                current_state: format!("{:?}", self.state),
                attempted: "duplicate local description".to_string(),
            });
        }
        self.local_description = Some(desc);
        Ok(())
    }

    /// Record the remote description and hand back the buffered candidates
    /// for application, in receipt order. Set at most once per session; a
    /// second offer/answer is rejected, not overwritten.
    pub fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<Vec<IceCandidate>, InvalidTransition> {
        if self.remote_description.is_some() {
            return Err(InvalidTransition {
                current_state: format!("{:?}", self.state),
                attempted: "duplicate remote description".to_string(),
            });
        }
        self.remote_description = Some(desc);
        Ok(std::mem::take(&mut self.pending_remote_candidates))
    }

    /// Buffer a candidate that arrived before the remote description.
    pub fn push_pending_candidate(&mut self, candidate: IceCandidate) {
        self.pending_remote_candidates.push(candidate);
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }
}

/// A transition not present in the table.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_caller_session() -> CallSession {
        CallSession::new_caller(1, "lobby", MediaKind::Audio)
    }

    fn make_callee_session() -> CallSession {
        CallSession::new_callee(
            2,
            "lobby",
            "peer-1",
            MediaKind::Video,
            SessionDescription::offer("v=0\r\n"),
        )
    }

    /// Flow: AwaitingMedia → Offering → RingingRemote → Connecting →
    /// Active → Ending → Ended.
    #[test]
    fn test_caller_flow() {
        let mut session = make_caller_session();
        assert!(matches!(session.state, CallState::AwaitingMedia));

        session.apply_transition(CallTransition::MediaReady).unwrap();
        assert!(matches!(session.state, CallState::Offering));

        session.apply_transition(CallTransition::OfferSent).unwrap();
        assert!(session.state.is_ringing());

        session
            .apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        assert!(matches!(session.state, CallState::Connecting { .. }));

        session
            .apply_transition(CallTransition::MediaFlowing)
            .unwrap();
        assert!(session.state.is_active());

        session
            .apply_transition(CallTransition::BeginTermination {
                reason: EndReason::HungUp,
            })
            .unwrap();
        assert!(session.state.is_ending());

        session.apply_transition(CallTransition::Finished).unwrap();
        assert!(session.state.is_terminal());

        // Duration recorded because the session reached Active.
        if let CallState::Ended { duration_secs, .. } = &session.state {
            assert!(duration_secs.is_some());
        } else {
            panic!("expected Ended");
        }
    }

    /// Flow: RingingLocal → AwaitingMedia → Answering → Connecting →
    /// Active.
    #[test]
    fn test_callee_flow() {
        let mut session = make_callee_session();
        assert!(session.state.can_answer());

        session
            .apply_transition(CallTransition::LocalAnswered)
            .unwrap();
        assert!(matches!(session.state, CallState::AwaitingMedia));

        session.apply_transition(CallTransition::MediaReady).unwrap();
        assert!(matches!(session.state, CallState::Answering));

        session.apply_transition(CallTransition::AnswerSent).unwrap();
        assert!(matches!(session.state, CallState::Connecting { .. }));

        session
            .apply_transition(CallTransition::MediaFlowing)
            .unwrap();
        assert!(session.state.is_active());
    }

    #[test]
    fn test_termination_before_active_has_no_duration() {
        let mut session = make_caller_session();
        session.apply_transition(CallTransition::MediaReady).unwrap();
        session.apply_transition(CallTransition::OfferSent).unwrap();
        session
            .apply_transition(CallTransition::BeginTermination {
                reason: EndReason::RemoteDeclined(None),
            })
            .unwrap();
        session.apply_transition(CallTransition::Finished).unwrap();

        if let CallState::Ended {
            reason,
            duration_secs,
            ..
        } = &session.state
        {
            assert_eq!(*reason, EndReason::RemoteDeclined(None));
            assert!(duration_secs.is_none());
        } else {
            panic!("expected Ended");
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut session = make_caller_session();

        // Can't accept before the offer was even built.
        assert!(
            session
                .apply_transition(CallTransition::RemoteAccepted)
                .is_err()
        );
        // Can't go active before both descriptions are set.
        assert!(
            session
                .apply_transition(CallTransition::MediaFlowing)
                .is_err()
        );
        // Callers never answer.
        assert!(
            session
                .apply_transition(CallTransition::LocalAnswered)
                .is_err()
        );
    }

    #[test]
    fn test_terminal_state_rejects_transitions() {
        let mut session = make_callee_session();
        session
            .apply_transition(CallTransition::BeginTermination {
                reason: EndReason::Declined,
            })
            .unwrap();
        session.apply_transition(CallTransition::Finished).unwrap();

        assert!(
            session
                .apply_transition(CallTransition::LocalAnswered)
                .is_err()
        );
        assert!(
            session
                .apply_transition(CallTransition::BeginTermination {
                    reason: EndReason::HungUp,
                })
                .is_err()
        );
    }

    #[test]
    fn test_remote_description_set_at_most_once() {
        let mut session = make_caller_session();
        session.push_pending_candidate(IceCandidate::new("candidate:1"));
        session.push_pending_candidate(IceCandidate::new("candidate:2"));

        let drained = session
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].candidate, "candidate:1");
        assert!(session.pending_remote_candidates.is_empty());

        assert!(
            session
                .set_remote_description(SessionDescription::answer("v=1\r\n"))
                .is_err()
        );
    }

    #[test]
    fn test_kind_never_mutates() {
        let mut session = make_callee_session();
        let kind = session.kind;
        session
            .apply_transition(CallTransition::LocalAnswered)
            .unwrap();
        session.apply_transition(CallTransition::MediaReady).unwrap();
        session.apply_transition(CallTransition::AnswerSent).unwrap();
        assert_eq!(session.kind, kind);
    }

    #[test]
    fn test_roles() {
        assert!(make_caller_session().is_caller());
        assert!(!make_callee_session().is_caller());
        // The caller always learns the outcome; a fresh caller session has
        // said nothing yet.
        assert!(!make_caller_session().peer_notified);
        assert!(make_callee_session().peer_notified);
    }
}
