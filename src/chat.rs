//! Chat relay.
//!
//! Sends and receives text messages over the room channel. Independent of
//! call state; the call machine never touches chat and vice versa.

use chrono::Local;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channel::{ChannelError, Envelope, RoomChannel};
use crate::events::EventBus;

/// A chat message as it travels on the wire and sits in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room: String,
    pub message: String,
    pub author: String,
    /// Local wall-clock send time, "HH:MM".
    pub time: String,
}

pub struct ChatRelay {
    room: String,
    author: String,
    channel: Arc<dyn RoomChannel>,
    history: RwLock<Vec<ChatMessage>>,
    bus: Arc<EventBus>,
}

impl ChatRelay {
    pub fn new(
        room: impl Into<String>,
        author: impl Into<String>,
        channel: Arc<dyn RoomChannel>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            room: room.into(),
            author: author.into(),
            channel,
            history: RwLock::new(Vec::new()),
            bus,
        }
    }

    /// Send a message to the room and append it to local history.
    pub async fn send(&self, text: impl Into<String>) -> Result<ChatMessage, ChannelError> {
        let message = ChatMessage {
            room: self.room.clone(),
            message: text.into(),
            author: self.author.clone(),
            time: Local::now().format("%H:%M").to_string(),
        };

        self.channel.emit(Envelope::send_message(&message)?).await?;
        self.history.write().await.push(message.clone());
        Ok(message)
    }

    /// Handle a message delivered by the room channel.
    pub async fn on_receive(&self, message: ChatMessage) {
        if message.room != self.room {
            debug!("dropping chat message for foreign room {}", message.room);
            return;
        }
        self.history.write().await.push(message.clone());
        let _ = self.bus.chat_message.send(Arc::new(message));
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.read().await.clone()
    }

    /// Drop local history, e.g. when leaving the room.
    pub async fn clear(&self) {
        self.history.write().await.clear();
    }

    pub fn author(&self) -> &str {
        &self.author
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct RecordingChannel {
        emitted: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl RoomChannel for RecordingChannel {
        async fn emit(&self, envelope: Envelope) -> Result<(), ChannelError> {
            self.emitted.lock().await.push(envelope);
            Ok(())
        }
    }

    fn make_relay() -> (Arc<RecordingChannel>, ChatRelay) {
        let channel = Arc::new(RecordingChannel {
            emitted: Mutex::new(Vec::new()),
        });
        let relay = ChatRelay::new(
            "lobby",
            "user-1",
            channel.clone(),
            Arc::new(EventBus::new()),
        );
        (channel, relay)
    }

    #[tokio::test]
    async fn test_send_emits_and_appends() {
        let (channel, relay) = make_relay();

        let sent = relay.send("hello").await.unwrap();
        assert_eq!(sent.author, "user-1");
        assert_eq!(sent.room, "lobby");

        let emitted = channel.emitted.lock().await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event, "send_message");
        assert_eq!(emitted[0].data["message"], "hello");

        assert_eq!(relay.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_appends_and_ignores_foreign_room() {
        let (_, relay) = make_relay();

        relay
            .on_receive(ChatMessage {
                room: "lobby".into(),
                message: "hi".into(),
                author: "peer-1".into(),
                time: "10:00".into(),
            })
            .await;
        relay
            .on_receive(ChatMessage {
                room: "other".into(),
                message: "stray".into(),
                author: "peer-2".into(),
                time: "10:01".into(),
            })
            .await;

        let history = relay.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "hi");
    }

    #[tokio::test]
    async fn test_clear_empties_history() {
        let (_, relay) = make_relay();
        relay.send("one").await.unwrap();
        relay.clear().await;
        assert!(relay.history().await.is_empty());
    }
}
