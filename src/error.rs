//! Crate-level error type surfaced by the client facade.

use thiserror::Error;

use crate::calls::CallError;
use crate::channel::ChannelError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
