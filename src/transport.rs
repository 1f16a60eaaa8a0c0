//! Duplex transport to the Gemini Live API
//!
//! The WebSocket is split into a write half owned by a writer task and a read
//! half owned by a reader task. The session controller only ever sees two
//! channels: outbound audio frames and inbound `TransportEvent`s.

use crate::pcm::EncodedFrame;
use crate::protocol::{
    BidiGenerateContentSetup, ClientMessage, Content, GenerationConfig, ResponseModality,
    ServerMessage, SpeechConfig,
};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

/// Default Live API endpoint; the API key is appended as a query parameter.
pub const GEMINI_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Outbound queue depth. Frames beyond it are dropped rather than queued.
pub const OUTBOUND_QUEUE_DEPTH: usize = 32;
const EVENT_QUEUE_DEPTH: usize = 100;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Error type for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("setup handshake failed: {0}")]
    Handshake(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("timed out waiting for setup")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Everything needed to open one tutoring session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// `None` waits for the server indefinitely.
    pub setup_timeout: Option<Duration>,
}

impl SessionRequest {
    pub fn setup_message(&self) -> ClientMessage {
        ClientMessage::Setup(BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: Some(SpeechConfig::prebuilt(&self.voice)),
            }),
            system_instruction: Some(Content::text(self.system_instruction.clone())),
        })
    }
}

/// Messages the controller pushes to the remote model.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Audio(EncodedFrame),
    AudioStreamEnd,
}

/// What the remote side reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One base64 PCM chunk of model speech (24 kHz mono).
    Audio(String),
    /// The user barged in; current playback must stop.
    Interrupted,
    TurnComplete,
    /// The server announced it will disconnect soon.
    GoAway,
    Closed(Option<String>),
    Error(String),
}

/// Opens transport sessions. Implemented by [`GeminiConnector`] and by test
/// doubles.
pub trait Connector: Send + Sync + 'static {
    /// Resolve once the remote side has confirmed the session is open.
    fn connect(&self, request: SessionRequest) -> BoxFuture<'static, Result<LiveSession>>;
}

/// An open session: the outbound queue, the inbound event stream, and the
/// means to shut both down.
pub struct LiveSession {
    outbound: mpsc::Sender<OutboundMessage>,
    events: mpsc::Receiver<TransportEvent>,
    shutdown: oneshot::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveSession {
    /// Assemble a session from raw channels. `shutdown` fires when the
    /// controller closes the session.
    pub fn from_parts(
        outbound: mpsc::Sender<OutboundMessage>,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            outbound,
            events,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Split into the sending half kept by the controller and the event
    /// stream it forwards.
    pub fn into_parts(self) -> (LiveSender, mpsc::Receiver<TransportEvent>) {
        (
            LiveSender {
                outbound: self.outbound,
                shutdown: Some(self.shutdown),
                tasks: self.tasks,
            },
            self.events,
        )
    }
}

/// Sending half of a session. Closing (or dropping) it ends the session.
pub struct LiveSender {
    outbound: mpsc::Sender<OutboundMessage>,
    shutdown: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveSender {
    /// Queue one frame without waiting. Returns `false` if the frame was
    /// dropped because the writer is behind or gone.
    pub fn try_send_audio(&self, frame: EncodedFrame) -> bool {
        match self.outbound.try_send(OutboundMessage::Audio(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Tell the server the input stream paused so it can flush cached audio.
    pub fn try_send_stream_end(&self) -> bool {
        match self.outbound.try_send(OutboundMessage::AudioStreamEnd) {
            Ok(()) => true,
            Err(e) => {
                debug!("Could not queue audio stream end: {}", e);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none()
    }

    /// Idempotent.
    pub fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Transport session closed");
    }
}

impl Drop for LiveSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connects to the real Gemini Live endpoint over TLS WebSocket.
#[derive(Debug, Clone, Default)]
pub struct GeminiConnector;

impl Connector for GeminiConnector {
    fn connect(&self, request: SessionRequest) -> BoxFuture<'static, Result<LiveSession>> {
        Box::pin(open_session(request))
    }
}

async fn open_session(request: SessionRequest) -> Result<LiveSession> {
    info!("Connecting to Gemini Live with model {}", request.model);
    let url = format!("{}?key={}", request.url, request.api_key);

    let (ws, resp) = connect_async(url.as_str()).await?;
    debug!("WebSocket connection response status: {}", resp.status());

    let (mut sink, mut stream) = ws.split();

    let setup = request.setup_message().to_json()?;
    sink.send(Message::Text(setup.into())).await?;
    info!("Setup message sent, waiting for acknowledgment");

    match request.setup_timeout {
        Some(limit) => tokio::time::timeout(limit, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                TransportError::Timeout
            })??,
        None => wait_for_setup_complete(&mut stream).await?,
    }
    info!("Gemini session setup complete");

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(run_writer(sink, outbound_rx, shutdown_rx, event_tx.clone()));
    let reader = tokio::spawn(run_reader(stream, event_tx));

    let mut session = LiveSession::from_parts(outbound_tx, event_rx, shutdown_tx);
    session.tasks.push(reader);
    Ok(session)
}

/// Text payload of a data frame. The Live API sends JSON in binary frames
/// as well as text frames.
fn frame_text(msg: &Message) -> Option<Cow<'_, str>> {
    match msg {
        Message::Text(text) => Some(Cow::Borrowed(text.as_str())),
        Message::Binary(bytes) => Some(String::from_utf8_lossy(bytes)),
        _ => None,
    }
}

async fn wait_for_setup_complete(stream: &mut WsSource) -> Result<()> {
    while let Some(msg) = stream.next().await {
        let msg = msg?;
        if let Message::Close(frame) = &msg {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(TransportError::Handshake(format!(
                "server closed during setup: {}",
                reason
            )));
        }
        let Some(text) = frame_text(&msg) else {
            continue;
        };
        match ServerMessage::parse(&text) {
            Ok(parsed) if parsed.setup_complete.is_some() => return Ok(()),
            Ok(_) => debug!("Ignoring message before setup complete"),
            Err(e) => warn!("Unparseable message during setup: {}", e),
        }
    }
    Err(TransportError::ConnectionClosed)
}

async fn run_writer(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut shutdown: oneshot::Receiver<()>,
    events: mpsc::Sender<TransportEvent>,
) {
    debug!("Writer task started");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let client_msg = match msg {
                    OutboundMessage::Audio(frame) => {
                        trace!("Sending audio frame ({} bytes)", frame.data.len());
                        ClientMessage::audio(frame.to_base64(), frame.mime_type)
                    }
                    OutboundMessage::AudioStreamEnd => ClientMessage::audio_stream_end(),
                };
                let json = match client_msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    error!("Failed to send message: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    return;
                }
            }
        }
    }
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!("Close frame not sent: {}", e);
    }
    let _ = sink.close().await;
    debug!("Writer task terminated");
}

async fn run_reader(mut stream: WsSource, events: mpsc::Sender<TransportEvent>) {
    debug!("Reader task started");
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                error!("WebSocket error: {}", e);
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                return;
            }
        };

        if let Message::Close(frame) = &msg {
            info!("WebSocket closed: {:?}", frame);
            let reason = frame.as_ref().map(|f| f.reason.to_string());
            let _ = events.send(TransportEvent::Closed(reason)).await;
            return;
        }

        let Some(text) = frame_text(&msg) else {
            continue;
        };
        let parsed = match ServerMessage::parse(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse server message: {}", e);
                continue;
            }
        };

        let batch = server_events(parsed);
        if batch.is_empty() {
            debug!("Ignoring server message without audio or turn signals");
        }
        for event in batch {
            if events.send(event).await.is_err() {
                debug!("Event receiver dropped, stopping reader");
                return;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed(None)).await;
    debug!("Reader task terminated");
}

/// Flatten one server message into events: audio first, then barge-in,
/// then turn bookkeeping.
pub fn server_events(msg: ServerMessage) -> Vec<TransportEvent> {
    let mut out = Vec::new();
    if let Some(content) = msg.server_content {
        out.extend(
            content
                .audio_chunks()
                .map(|data| TransportEvent::Audio(data.to_string())),
        );
        if content.interrupted {
            out.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            out.push(TransportEvent::TurnComplete);
        }
    }
    if msg.go_away.is_some() {
        out.push(TransportEvent::GoAway);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> SessionRequest {
        SessionRequest {
            url: GEMINI_LIVE_URL.to_string(),
            api_key: "key".to_string(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Puck".to_string(),
            system_instruction: "text".to_string(),
            setup_timeout: None,
        }
    }

    #[test]
    fn setup_message_negotiates_audio() {
        let json: serde_json::Value =
            serde_json::from_str(&request().setup_message().to_json().unwrap()).unwrap();
        assert_eq!(
            json["setup"]["model"],
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "text");
    }

    #[test]
    fn server_events_orders_audio_before_interrupt() {
        let msg = ServerMessage::parse(
            &json!({
                "serverContent": {
                    "modelTurn": {"parts": [{"inlineData": {"data": "AAA="}}]},
                    "interrupted": true,
                    "turnComplete": true
                }
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(
            server_events(msg),
            vec![
                TransportEvent::Audio("AAA=".to_string()),
                TransportEvent::Interrupted,
                TransportEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn go_away_is_reported() {
        let msg = ServerMessage::parse(&json!({"goAway": {"timeLeft": "5s"}}).to_string()).unwrap();
        assert_eq!(server_events(msg), vec![TransportEvent::GoAway]);
    }

    #[test]
    fn frame_text_reads_binary_json() {
        let msg = Message::Binary(br#"{"setupComplete":{}}"#.to_vec().into());
        let text = frame_text(&msg).unwrap();
        assert!(ServerMessage::parse(&text).unwrap().setup_complete.is_some());
        assert!(frame_text(&Message::Ping(Vec::new().into())).is_none());
    }

    #[tokio::test]
    async fn sender_drops_frames_when_queue_is_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let (_event_tx, event_rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (mut sender, _events) = LiveSession::from_parts(tx, event_rx, shutdown_tx).into_parts();

        assert!(sender.try_send_audio(EncodedFrame::from_samples(&[0.0])));
        assert!(!sender.try_send_audio(EncodedFrame::from_samples(&[0.0])));
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Audio(_))));

        sender.close();
        sender.close();
        assert!(sender.is_closed());
        assert!(shutdown_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stream_end_follows_queued_audio() {
        let (tx, mut rx) = mpsc::channel(4);
        let (_event_tx, event_rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        let (sender, _events) = LiveSession::from_parts(tx, event_rx, shutdown_tx).into_parts();

        assert!(sender.try_send_audio(EncodedFrame::from_samples(&[0.1])));
        assert!(sender.try_send_stream_end());
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Audio(_))));
        assert!(matches!(rx.recv().await, Some(OutboundMessage::AudioStreamEnd)));
    }
}
