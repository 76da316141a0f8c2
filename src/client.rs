//! Room client facade.
//!
//! Wires the room channel, chat relay, and call machine together. One
//! routing task hands inbound frames to their owners; the call machine
//! runs on its own task consuming the serialized session queue. UI
//! intents enter through the methods here and nowhere else.

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, watch};

use crate::calls::CallError;
use crate::calls::machine::{CallIntent, CallMachine, SessionEvent};
use crate::calls::negotiation::EngineFactory;
use crate::calls::state::CallState;
use crate::channel::{ChannelError, ChannelEvent, Envelope, RoomChannel};
use crate::chat::{ChatMessage, ChatRelay};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{Disconnected, EventBus, RoomJoined, UserJoined, UserLeft};
use crate::media::{MediaKind, MediaSource};
use crate::socket::SocketEvent;

pub struct RoomClient {
    room: String,
    channel: Arc<dyn RoomChannel>,
    chat: Arc<ChatRelay>,
    bus: Arc<EventBus>,
    call_tx: mpsc::UnboundedSender<SessionEvent>,
    call_state: watch::Receiver<CallState>,
    shutdown_notifier: Arc<Notify>,
}

impl RoomClient {
    /// Build the client and start its background tasks. The channel handle
    /// is passed in explicitly; its lifecycle (connect before, close after)
    /// belongs to the caller.
    pub fn new(
        room: impl Into<String>,
        display_name: impl Into<String>,
        config: ClientConfig,
        channel: Arc<dyn RoomChannel>,
        inbound: mpsc::Receiver<SocketEvent>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn EngineFactory>,
    ) -> Arc<Self> {
        let room = room.into();
        let bus = Arc::new(EventBus::new());
        let chat = Arc::new(ChatRelay::new(
            room.clone(),
            display_name,
            channel.clone(),
            bus.clone(),
        ));

        let (machine, call_tx, call_rx, call_state) = CallMachine::new(
            room.clone(),
            config,
            channel.clone(),
            media,
            engines,
            bus.clone(),
        );
        tokio::spawn(machine.run(call_rx));

        let client = Arc::new(Self {
            room,
            channel,
            chat,
            bus,
            call_tx,
            call_state,
            shutdown_notifier: Arc::new(Notify::new()),
        });

        let router = client.clone();
        tokio::spawn(async move { router.route_inbound(inbound).await });

        client
    }

    /// Join the room. Membership only; no session effect.
    pub async fn join(&self) -> Result<(), ClientError> {
        self.channel.emit(Envelope::join_room(&self.room)).await?;
        Ok(())
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// The typed event bus toward the embedding UI layer.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn call_state(&self) -> CallState {
        self.call_state.borrow().clone()
    }

    /// A watch on the call state, for callers that want to await changes
    /// instead of subscribing to the bus.
    pub fn watch_call_state(&self) -> watch::Receiver<CallState> {
        self.call_state.clone()
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage, ClientError> {
        Ok(self.chat.send(text).await?)
    }

    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        self.chat.history().await
    }

    /// Start a call. Refused while any session exists; this is the intent
    /// boundary, not a state transition.
    pub fn start_call(&self, kind: MediaKind) -> Result<(), ClientError> {
        let state = self.call_state.borrow().clone();
        if !state.is_idle() {
            return Err(CallError::DuplicateSession(state.status_text().to_string()).into());
        }
        self.send_intent(CallIntent::Start { kind })
    }

    /// Answer the ringing call.
    pub fn answer_call(&self) -> Result<(), ClientError> {
        self.send_intent(CallIntent::Answer)
    }

    /// Decline the ringing call before media ever connects.
    pub fn reject_call(&self) -> Result<(), ClientError> {
        self.send_intent(CallIntent::Reject)
    }

    /// Hang up whatever call is in progress. A no-op when idle.
    pub fn end_call(&self) -> Result<(), ClientError> {
        self.send_intent(CallIntent::HangUp)
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), ClientError> {
        self.send_intent(CallIntent::SetMuted(muted))
    }

    pub fn set_video_suppressed(&self, suppressed: bool) -> Result<(), ClientError> {
        self.send_intent(CallIntent::SetVideoSuppressed(suppressed))
    }

    /// Tear down the call machine and the routing task. The channel itself
    /// stays open; closing it belongs to whoever created it.
    pub fn shutdown(&self) {
        let _ = self.call_tx.send(SessionEvent::Shutdown);
        self.shutdown_notifier.notify_waiters();
    }

    fn send_intent(&self, intent: CallIntent) -> Result<(), ClientError> {
        self.call_tx
            .send(SessionEvent::Intent(intent))
            .map_err(|_| ClientError::Channel(ChannelError::NotConnected))
    }

    /// Terminates when shutdown is signaled or the socket goes away.
    async fn route_inbound(&self, mut inbound: mpsc::Receiver<SocketEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown_notifier.notified() => break,
                event = inbound.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        SocketEvent::Frame(envelope) => self.dispatch(envelope).await,
                        SocketEvent::Disconnected => {
                            // A dead transport ends any in-flight call.
                            let _ = self.call_tx.send(SessionEvent::Intent(CallIntent::HangUp));
                            let _ = self.bus.disconnected.send(Arc::new(Disconnected));
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let decoded = match ChannelEvent::decode(&envelope) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("dropping inbound frame: {e}");
                return;
            }
        };
        match decoded {
            None => debug!("ignoring {} frame", envelope.event),
            Some(ChannelEvent::Connected) => debug!("relay hello received"),
            Some(ChannelEvent::RoomJoined { room }) => {
                let _ = self.bus.room_joined.send(Arc::new(RoomJoined { room }));
            }
            Some(ChannelEvent::UserJoined { user_id }) => {
                let _ = self.bus.user_joined.send(Arc::new(UserJoined { user_id }));
            }
            Some(ChannelEvent::UserLeft { user_id }) => {
                let _ = self.bus.user_left.send(Arc::new(UserLeft { user_id }));
            }
            Some(ChannelEvent::Message(message)) => self.chat.on_receive(message).await,
            Some(ChannelEvent::Signal(signal)) => {
                let _ = self.call_tx.send(SessionEvent::Signal(signal));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::negotiation::DisabledEngineFactory;
    use crate::media::NullMediaSource;
    use async_trait::async_trait;
    use serde_json::json;
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

    fn make_client() -> (
        Arc<RecordingChannel>,
        mpsc::Sender<SocketEvent>,
        Arc<RoomClient>,
    ) {
        let channel = Arc::new(RecordingChannel {
            emitted: Mutex::new(Vec::new()),
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let client = RoomClient::new(
            "lobby",
            "user-1",
            ClientConfig::default(),
            channel.clone(),
            inbound_rx,
            Arc::new(NullMediaSource),
            Arc::new(DisabledEngineFactory),
        );
        (channel, inbound_tx, client)
    }

    #[tokio::test]
    async fn test_join_emits_join_room() {
        let (channel, _inbound, client) = make_client();
        client.join().await.unwrap();

        let emitted = channel.emitted.lock().await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event, "join_room");
        assert_eq!(emitted[0].data, json!("lobby"));
    }

    #[tokio::test]
    async fn test_inbound_chat_reaches_history() {
        let (_channel, inbound, client) = make_client();

        inbound
            .send(SocketEvent::Frame(Envelope::new(
                "receive_message",
                json!({
                    "room": "lobby",
                    "message": "hi",
                    "author": "peer-1",
                    "time": "10:00",
                }),
            )))
            .await
            .unwrap();

        // The routing task runs concurrently; wait for the append to land.
        for _ in 0..50 {
            if !client.chat_history().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let history = client.chat_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "hi");
    }

    #[tokio::test]
    async fn test_start_call_refused_while_busy() {
        let (_channel, inbound, client) = make_client();

        inbound
            .send(SocketEvent::Frame(Envelope::new(
                "incoming_call",
                json!({
                    "from": "peer-1",
                    "offer": {"type": "offer", "sdp": "v=0\r\n"},
                    "callType": "audio",
                    "room": "lobby",
                }),
            )))
            .await
            .unwrap();

        let mut state = client.watch_call_state();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !state.borrow().is_ringing() {
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("call never rang");

        assert!(matches!(
            client.start_call(MediaKind::Audio),
            Err(ClientError::Call(CallError::DuplicateSession(_)))
        ));
    }
}
