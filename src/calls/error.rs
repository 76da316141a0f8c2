//! Call-related error types.

use thiserror::Error;

use super::negotiation::NegotiationError;
use super::state::InvalidTransition;
use crate::channel::ChannelError;
use crate::media::MediaAcquisitionError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaAcquisitionError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("remote terminated call: {reason}")]
    RemoteTermination { reason: String },

    #[error("a call is already in progress: {0}")]
    DuplicateSession(String),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("no call in progress")]
    NoSession,
}
