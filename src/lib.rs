//! Two-party room chat and call signaling.
//!
//! Pairs of participants in a named room exchange text messages and
//! negotiate a real-time audio/video session over an opaque relay. The
//! heart of the crate is the call session state machine in [`calls`];
//! [`client::RoomClient`] wires it to a room channel, a chat relay, and
//! the typed event bus the embedding UI subscribes to.

pub mod calls;
pub mod channel;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod socket;

pub use client::RoomClient;
pub use config::ClientConfig;
pub use error::ClientError;
