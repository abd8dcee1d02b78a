//! Gemini Live API client over `tokio-tungstenite`.
//!
//! ```text
//! connect:  ws handshake ─► setup ─► wait setupComplete (15 s budget)
//! running:  writer task  outbound mpsc ─► realtimeInput.mediaChunks
//!           reader task  serverContent ─► TransportEvent
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{
    protocol::{RealtimeInputMessage, ServerMessage, SetupMessage},
    TransportEvent, TransportHandle, TransportLink, VoiceTransport,
};
use crate::{
    codec::EncodedChunk,
    config::SessionConfig,
    error::{ParleyError, Result},
};

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Budget for socket handshake plus `setupComplete`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct GeminiLiveTransport {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: LIVE_ENDPOINT.into(),
        }
    }

    /// Point at a different server (proxies, local mocks).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key.trim())
    }
}

impl std::fmt::Debug for GeminiLiveTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl VoiceTransport for GeminiLiveTransport {
    async fn connect(
        &self,
        config: &SessionConfig,
        link: TransportLink,
    ) -> Result<TransportHandle> {
        if self.api_key.trim().is_empty() {
            return Err(ParleyError::Connect("missing API key".into()));
        }

        let setup = SetupMessage::from_config(config);
        let ws = tokio::time::timeout(CONNECT_TIMEOUT, handshake(self.url(), setup))
            .await
            .map_err(|_| {
                ParleyError::Connect(format!(
                    "no setup acknowledgement within {}s",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })??;

        info!(
            model = config.model.as_str(),
            voice = config.response_voice.as_str(),
            "live session established"
        );

        let (sink, stream) = ws.split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let TransportLink { outbound, events } = link;

        let writer = tokio::spawn(write_loop(sink, outbound, shutdown_rx, events.clone()));
        let reader = tokio::spawn(read_loop(stream, events));

        // The writer ends itself on shutdown so it can send a close frame.
        Ok(TransportHandle::new(shutdown_tx, vec![reader.abort_handle()])
            .with_graceful(vec![writer.abort_handle()]))
    }
}

async fn handshake(url: String, setup: SetupMessage) -> Result<WsStream> {
    let (mut ws, response) = connect_async(url)
        .await
        .map_err(|e| ParleyError::Connect(e.to_string()))?;
    debug!(status = %response.status(), "websocket upgraded");

    let json = serde_json::to_string(&setup).map_err(|e| ParleyError::Connect(e.to_string()))?;
    ws.send(Message::Text(json))
        .await
        .map_err(|e| ParleyError::Connect(e.to_string()))?;

    loop {
        let payload = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "no reason given".into());
                return Err(ParleyError::Connect(format!(
                    "server closed during setup: {reason}"
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ParleyError::Connect(e.to_string())),
            None => {
                return Err(ParleyError::Connect(
                    "connection closed during setup".into(),
                ))
            }
        };

        match serde_json::from_slice::<ServerMessage>(&payload) {
            Ok(msg) if msg.is_setup_complete() => return Ok(ws),
            Ok(_) => debug!("ignoring pre-setup server message"),
            Err(e) => warn!("unparseable server message during setup: {e}"),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<EncodedChunk>,
    mut shutdown: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            chunk = outbound.recv() => {
                let Some(chunk) = chunk else { break };
                let json = match serde_json::to_string(&RealtimeInputMessage::audio(chunk)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to serialise audio frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    let _ = events.send(TransportEvent::Error(format!("send failed: {e}")));
                    return;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    debug!("writer stopped");
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(message) = stream.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                info!(reason = reason.as_deref().unwrap_or(""), "server closed the session");
                let _ = events.send(TransportEvent::Closed(reason));
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
        };

        let msg = match serde_json::from_slice::<ServerMessage>(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("unparseable server message: {e}");
                continue;
            }
        };
        if let Some(go_away) = &msg.go_away {
            warn!(time_left = go_away.time_left.as_deref().unwrap_or("?"), "server going away");
        }
        for event in msg.into_events() {
            if events.send(event).is_err() {
                return;
            }
        }
    }

    let _ = events.send(TransportEvent::Closed(None));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_api_key_is_a_connect_error() {
        let (_tx, outbound) = mpsc::channel(1);
        let (events, _rx) = mpsc::unbounded_channel();
        let transport = GeminiLiveTransport::new("   ");

        let err = transport
            .connect(&SessionConfig::default(), TransportLink { outbound, events })
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Connect(_)));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let transport = GeminiLiveTransport::new("secret-key");
        assert!(!format!("{transport:?}").contains("secret-key"));
        assert!(transport.url().ends_with("?key=secret-key"));
    }
}
