//! Typed event bus toward the embedding UI layer.
//!
//! Separate broadcast channels per event type; subscribers pick the
//! channels they care about and lagging subscribers only lose their own
//! backlog.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::calls::negotiation::{ConnectionState, RemoteTrack};
use crate::calls::state::{CallState, EndReason};
use crate::chat::ChatMessage;
use crate::media::{MediaFlags, MediaKind};

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The call state changed; `status` is the transient UI status text.
#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub state: CallState,
    pub kind: Option<MediaKind>,
    pub status: String,
}

/// A peer is calling; the UI should present answer/reject.
#[derive(Debug, Clone)]
pub struct IncomingCallNotice {
    pub from: String,
    pub kind: MediaKind,
    pub room: String,
}

/// The session reached a terminal state.
#[derive(Debug, Clone)]
pub struct CallEndedNotice {
    pub reason: EndReason,
    pub duration_secs: Option<i64>,
}

/// A call error to show the user. Cleared by `call_error_cleared` after
/// the configured display duration.
#[derive(Debug, Clone)]
pub struct CallErrorNotice {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CallErrorCleared;

/// One tick of the call-duration timer, once per second while active.
#[derive(Debug, Clone)]
pub struct CallTimer {
    pub seconds: i64,
}

#[derive(Debug, Clone)]
pub struct RoomJoined {
    pub room: String,
}

#[derive(Debug, Clone)]
pub struct UserJoined {
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct UserLeft {
    pub user_id: String,
}

/// The transport behind the room channel went away.
#[derive(Debug, Clone)]
pub struct Disconnected;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Room membership
    (room_joined, Arc<RoomJoined>),
    (user_joined, Arc<UserJoined>),
    (user_left, Arc<UserLeft>),
    (disconnected, Arc<Disconnected>),

    // Chat
    (chat_message, Arc<ChatMessage>),

    // Call lifecycle
    (call_state, Arc<CallStateChanged>),
    (incoming_call, Arc<IncomingCallNotice>),
    (call_ended, Arc<CallEndedNotice>),
    (call_error, Arc<CallErrorNotice>),
    (call_error_cleared, Arc<CallErrorCleared>),
    (call_timer, Arc<CallTimer>),
    (remote_track, Arc<RemoteTrack>),
    (connection_state, Arc<ConnectionState>),
    (media_flags, Arc<MediaFlags>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
