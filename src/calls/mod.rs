//! Call signaling and session state.
//!
//! Two participants in a room negotiate a real-time audio/video session:
//! one offers, the other answers, and connectivity candidates trickle in
//! both directions until media flows. This module owns that lifecycle.
//!
//! # Architecture
//!
//! - [`state::CallSession`] & [`state::CallState`]: the authoritative
//!   session record and its transition table
//! - [`machine::CallMachine`]: the serialized event loop driving the
//!   session, the only writer of call state
//! - [`negotiation`]: the adapter contract for the opaque
//!   offer/answer/candidate engine
//! - [`signaling`]: wire event names and payloads carried over the room
//!   channel
//!
//! Everything that can affect a session (UI intents, inbound signaling,
//! engine callbacks, timer ticks) enters the machine's queue and is
//! applied in receipt order.

pub mod machine;
pub mod negotiation;
pub mod signaling;
pub mod state;

mod error;

pub use error::CallError;
pub use machine::{CallIntent, CallMachine, SessionEvent};
pub use state::{CallRole, CallSession, CallState, CallTransition, EndReason, InvalidTransition};
