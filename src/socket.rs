//! WebSocket room channel.
//!
//! Default [`RoomChannel`] implementation: JSON text frames
//! (`{"event": ..., "data": ...}`) over a WebSocket to the relay. The
//! socket is split at connect time; outbound frames go through the sink
//! behind a lock, inbound frames are decoded by a read pump and delivered
//! on an event channel for the client to route.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use async_trait::async_trait;

use crate::channel::{ChannelError, Envelope, RoomChannel};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// What the read pump delivers to the client.
#[derive(Debug)]
pub enum SocketEvent {
    Frame(Envelope),
    /// The connection was lost or closed by the relay.
    Disconnected,
}

pub struct WebSocketChannel {
    sink: Mutex<Option<WsSink>>,
}

impl WebSocketChannel {
    /// Dial the relay. Inbound frames arrive on the returned receiver
    /// until the connection dies, which is reported as the final
    /// [`SocketEvent::Disconnected`].
    pub async fn connect(
        url: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SocketEvent>), ChannelError> {
        debug!("dialing {url}");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel(100);
        tokio::spawn(read_pump(stream, event_tx));

        let channel = Arc::new(Self {
            sink: Mutex::new(Some(sink)),
        });
        Ok((channel, event_rx))
    }

    /// Close the outbound half. Idempotent; the read pump reports
    /// `Disconnected` once the relay acknowledges.
    pub async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

#[async_trait]
impl RoomChannel for WebSocketChannel {
    async fn emit(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let text = serde_json::to_string(&envelope).map_err(|e| ChannelError::Payload {
            event: envelope.event.clone(),
            source: e,
        })?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        trace!("--> {}", envelope.event);
        sink.send(Message::text(text))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<SocketEvent>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                Ok(envelope) => {
                    trace!("<-- {}", envelope.event);
                    if event_tx.send(SocketEvent::Frame(envelope)).await.is_err() {
                        warn!("event receiver dropped, closing read pump");
                        return;
                    }
                }
                Err(e) => warn!("dropping malformed frame: {e}"),
            },
            Ok(Message::Close(_)) => {
                trace!("received close frame");
                break;
            }
            // Ping/pong are answered by the library; the relay sends no
            // binary frames.
            Ok(_) => {}
            Err(e) => {
                error!("socket read error: {e}");
                break;
            }
        }
    }

    let _ = event_tx.send(SocketEvent::Disconnected).await;
}
