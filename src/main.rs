use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use roomcall::calls::negotiation::DisabledEngineFactory;
use roomcall::client::RoomClient;
use roomcall::config::ClientConfig;
use roomcall::media::{MediaKind, NullMediaSource};
use roomcall::socket::WebSocketChannel;

// Headless demo client: joins a room, relays chat lines from stdin, and
// logs call signaling as it happens.
//
// Usage:
//   cargo run -- --room lobby
//   cargo run -- --room lobby --name alice --server ws://relay.example:8443/ws
//
// In-room commands:
//   /call [audio|video]   start a call
//   /answer  /reject      respond to a ringing call
//   /hangup               end the current call
//   /mute [on|off]        toggle the microphone
//   /video [on|off]       toggle outbound video
//   /quit                 leave
//   anything else         sent as a chat message

/// Two-party room chat and call-signaling demo.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Relay WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:8443/ws")]
    server: String,

    /// Room to join.
    #[arg(short, long)]
    room: String,

    /// Display name shown on chat messages. Random when omitted.
    #[arg(short, long)]
    name: Option<String>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let name = args
            .name
            .unwrap_or_else(|| format!("guest-{:04x}", rand::random::<u16>()));

        let (channel, inbound) = match WebSocketChannel::connect(&args.server).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Failed to connect to {}: {e}", args.server);
                return;
            }
        };

        let client = RoomClient::new(
            args.room.clone(),
            name.clone(),
            ClientConfig::default(),
            channel.clone(),
            inbound,
            Arc::new(NullMediaSource),
            Arc::new(DisabledEngineFactory),
        );

        if let Err(e) = client.join().await {
            error!("Failed to join {}: {e}", args.room);
            return;
        }
        info!("Joined room {} as {}", args.room, name);

        spawn_event_logging(&client);

        let stdin_client = client.clone();
        let stdin_task = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !handle_line(&stdin_client, line.trim()).await {
                    break;
                }
            }
        });

        tokio::select! {
            _ = stdin_task => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving room");
            }
        }

        let _ = client.end_call();
        client.shutdown();
        channel.close().await;
    });
}

/// Returns false when the user asked to quit.
async fn handle_line(client: &Arc<RoomClient>, line: &str) -> bool {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    let result = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/call" => {
            let kind = match rest {
                "" | "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                other => {
                    warn!("Unknown call type {other:?}; use audio or video");
                    return true;
                }
            };
            client.start_call(kind)
        }
        "/answer" => client.answer_call(),
        "/reject" => client.reject_call(),
        "/hangup" => client.end_call(),
        "/mute" => client.set_muted(rest != "off"),
        "/video" => client.set_video_suppressed(rest == "off"),
        _ if command.starts_with('/') => {
            warn!("Unknown command {command}");
            Ok(())
        }
        _ => client.send_chat(line).await.map(|_| ()),
    };

    if let Err(e) = result {
        warn!("{e}");
    }
    true
}

fn spawn_event_logging(client: &Arc<RoomClient>) {
    let bus = client.bus();

    let mut chat = bus.chat_message.subscribe();
    let mut user_joined = bus.user_joined.subscribe();
    let mut user_left = bus.user_left.subscribe();
    let mut incoming = bus.incoming_call.subscribe();
    let mut call_state = bus.call_state.subscribe();
    let mut call_ended = bus.call_ended.subscribe();
    let mut call_error = bus.call_error.subscribe();
    let mut call_timer = bus.call_timer.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(msg) = chat.recv() => {
                    info!("[{}] {}: {}", msg.time, msg.author, msg.message);
                }
                Ok(user) = user_joined.recv() => {
                    info!("{} joined the room", user.user_id);
                }
                Ok(user) = user_left.recv() => {
                    info!("{} left the room", user.user_id);
                }
                Ok(call) = incoming.recv() => {
                    info!(
                        "Incoming {} call from {} (/answer or /reject)",
                        call.kind, call.from
                    );
                }
                Ok(change) = call_state.recv() => {
                    if !change.status.is_empty() {
                        info!("{}", change.status);
                    }
                }
                Ok(ended) = call_ended.recv() => {
                    match ended.duration_secs {
                        Some(secs) => info!("{} after {}s", ended.reason, secs),
                        None => info!("{}", ended.reason),
                    }
                }
                Ok(notice) = call_error.recv() => {
                    warn!("Call error: {}", notice.message);
                }
                Ok(tick) = call_timer.recv() => {
                    // Once a minute is enough for a log line.
                    if tick.seconds % 60 == 0 && tick.seconds > 0 {
                        info!("Call running for {}s", tick.seconds);
                    }
                }
                else => break,
            }
        }
    });
}
