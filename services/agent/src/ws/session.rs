//! Manages the WebSocket connection lifecycle for a voice session.

use super::protocol::{ClientMessage, ServerMessage};
use crate::audio_utils::{FrameAssembler, PIPELINE_SAMPLE_RATE, StreamResampler};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use voxline_core::audio::{AudioFrameBus, BusPeer, pcm16_from_le_bytes, pcm16_to_le_bytes};
use voxline_core::tools::{McpToolServer, ToolRegistry};
use voxline_core::{SessionEvent, SessionOrchestrator};

/// Frames buffered between the socket and the session in each direction.
const BUS_CAPACITY: usize = 256;
/// Client audio rates accepted in `init`.
const CLIENT_SAMPLE_RATES: std::ops::RangeInclusive<u32> = 8_000..=192_000;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Performs the `init` handshake, then runs the session until either side ends it.
#[instrument(name = "ws_connection", skip_all)]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting initialization...");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let (room, sample_rate) = match init {
        Ok(init) => init,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                    fatal: true,
                },
            )
            .await;
            return;
        }
    };

    if let Err(e) = run_session(state, socket_tx, socket_rx, room, sample_rate).await {
        error!(error = ?e, "Voice session terminated with error.");
    }
}

fn parse_init(text: &str) -> Result<(String, u32)> {
    match serde_json::from_str::<ClientMessage>(text)? {
        ClientMessage::Init { sample_rate, .. } if !CLIENT_SAMPLE_RATES.contains(&sample_rate) => Err(anyhow!(
            "`sample_rate` {} is outside {}..={} Hz",
            sample_rate,
            CLIENT_SAMPLE_RATES.start(),
            CLIENT_SAMPLE_RATES.end()
        )),
        ClientMessage::Init { room, sample_rate } => Ok((room, sample_rate)),
        _ => Err(anyhow!("First message must be `init`")),
    }
}

/// Builds the session's tool registry. The remote server is discovered per
/// session; when it is unreachable the session runs degraded instead of failing.
async fn build_tools(state: &AppState) -> ToolRegistry {
    let mut builder = ToolRegistry::builder().call_timeout(state.config.session.tool_call_timeout);
    if let Some(url) = &state.config.tool_server_url {
        builder = match McpToolServer::connect_http(url, state.config.assistant_key.as_deref()).await {
            Ok(server) => builder.remote(Arc::new(server)),
            Err(e) => {
                warn!(error = %e, "Tool server unreachable; continuing without remote tools.");
                builder.remote_unavailable(e.to_string())
            }
        };
    }
    builder.build().await
}

/// Bridges the socket and a running session: client audio is resampled and
/// framed into the session, synthesized audio and events flow back out.
async fn run_session(
    state: Arc<AppState>,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut socket_rx: SplitStream<WebSocket>,
    room: String,
    client_rate: u32,
) -> Result<()> {
    let tools = Arc::new(build_tools(&state).await);
    let (bus, peer) = AudioFrameBus::channel(BUS_CAPACITY);
    let BusPeer { input, mut output } = peer;
    let mut handle = SessionOrchestrator::new(
        state.config.session.clone(),
        state.collaborators.clone(),
        tools,
    )
    .with_system_prompt(state.system_prompt.as_str())
    .with_room(room.clone())
    .spawn(bus);
    let control = handle.control();

    send_msg(
        &mut socket_tx,
        ServerMessage::Initialized {
            session_id: handle.id,
            sample_rate: client_rate,
        },
    )
    .await?;
    info!(session_id = %handle.id, %room, client_rate, "Voice session initialized.");

    let mut inbound = StreamResampler::new(client_rate, PIPELINE_SAMPLE_RATE)?;
    let mut assembler = FrameAssembler::new(PIPELINE_SAMPLE_RATE);
    // Keyed by the source rate of the synthesized frames.
    let mut outbound: Option<(u32, StreamResampler)> = None;
    let mut input = Some(input);
    let mut client_open = true;

    loop {
        tokio::select! {
            msg = socket_rx.next(), if client_open => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let Some(tx) = &input else { continue };
                    let samples = inbound.process(&pcm16_from_le_bytes(&data))?;
                    for frame in assembler.push(&samples) {
                        if tx.try_send(frame).is_err() {
                            warn!("Session input is full; dropping audio frame.");
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Say { text, allow_interruptions }) => {
                        if let Err(e) = control.say(text, allow_interruptions) {
                            warn!(error = %e, "Could not queue `say` request.");
                        }
                    }
                    Ok(ClientMessage::Hangup) => {
                        info!("Client requested hangup.");
                        control.hangup();
                    }
                    Ok(ClientMessage::Init { .. }) => warn!("Ignoring repeated `init` message."),
                    Err(e) => warn!(error = %e, "Ignoring malformed client message."),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection. Shutting down session.");
                    client_open = false;
                    input = None;
                    control.hangup();
                }
                Some(Err(e)) => {
                    error!("Error receiving from client WebSocket: {:?}", e);
                    client_open = false;
                    input = None;
                    control.hangup();
                }
            },
            Some(frame) = output.recv() => {
                if !client_open {
                    continue;
                }
                if outbound.as_ref().map(|(rate, _)| *rate) != Some(frame.sample_rate) {
                    outbound = Some((frame.sample_rate, StreamResampler::new(frame.sample_rate, client_rate)?));
                }
                if let Some((_, resampler)) = outbound.as_mut() {
                    let samples = resampler.process(&frame.samples)?;
                    if !samples.is_empty() {
                        socket_tx.send(Message::Binary(pcm16_to_le_bytes(&samples).into())).await?;
                    }
                }
            },
            event = handle.next_event() => match event {
                Some(SessionEvent::Ended) | None => break,
                Some(event) => {
                    if let (true, Some(msg)) = (client_open, ServerMessage::from_event(&event)) {
                        send_msg(&mut socket_tx, msg).await?;
                    }
                }
            },
        }
    }

    match handle.join().await {
        Ok(session) => info!(entries = session.history.len(), "Voice session finished."),
        Err(e) => warn!(error = %e, "Voice session ended with an error."),
    }
    if client_open {
        let _ = socket_tx.send(Message::Close(None)).await;
    }
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
