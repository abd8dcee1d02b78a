//! Connection to the remote voice endpoint.
//!
//! A transport is plumbing between two channels:
//!
//! ```text
//!  capture ──OutboundSender──► mpsc (bounded) ──► writer task ──► socket
//!  socket ──► reader task ──► TransportEvent (unbounded) ──► session event loop
//! ```
//!
//! The session owns both channel ends it needs and hands the rest to
//! [`VoiceTransport::connect`] as a [`TransportLink`].

pub mod gemini;
pub mod protocol;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};
use tracing::{debug, warn};

use crate::{
    codec::EncodedChunk,
    config::SessionConfig,
    error::{ParleyError, Result},
    session::diagnostics::SessionDiagnostics,
};

pub use gemini::GeminiLiveTransport;

/// Inbound events, delivered in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AudioChunk(EncodedChunk),
    /// The user barged in; queued model audio must stop.
    Interrupted,
    TurnComplete,
    Text(String),
    /// Remote side closed the connection, with its reason if any.
    Closed(Option<String>),
    Error(String),
}

/// Channel ends a transport needs for one connection.
pub struct TransportLink {
    /// Encoded microphone frames, in capture order.
    pub outbound: mpsc::Receiver<EncodedChunk>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
pub trait VoiceTransport: Send + Sync + 'static {
    /// Open a connection and start moving data between `link` and the remote.
    ///
    /// # Errors
    /// `ParleyError::Connect` on authentication, network or handshake failure.
    async fn connect(&self, config: &SessionConfig, link: TransportLink)
        -> Result<TransportHandle>;
}

/// How long a task registered with [`TransportHandle::with_graceful`] gets
/// to finish on its own after shutdown is signalled.
pub const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Owned handle to a live connection. Closing is idempotent.
#[derive(Debug)]
pub struct TransportHandle {
    shutdown: Option<oneshot::Sender<()>>,
    tasks: Vec<AbortHandle>,
    graceful: Vec<AbortHandle>,
}

impl TransportHandle {
    /// `shutdown` asks the writer to close the socket gracefully; `tasks`
    /// are aborted once it has been signalled.
    pub fn new(shutdown: oneshot::Sender<()>, tasks: Vec<AbortHandle>) -> Self {
        Self {
            shutdown: Some(shutdown),
            tasks,
            graceful: Vec::new(),
        }
    }

    /// Tasks that wind down on shutdown by themselves (the writer sending its
    /// close frame). They are aborted if still running after [`CLOSE_GRACE`].
    pub fn with_graceful(mut self, tasks: Vec<AbortHandle>) -> Self {
        self.graceful = tasks;
        self
    }

    pub fn close(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());
        for task in self.tasks.drain(..) {
            task.abort();
        }

        let graceful = std::mem::take(&mut self.graceful);
        if !graceful.is_empty() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        tokio::time::sleep(CLOSE_GRACE).await;
                        for task in graceful {
                            task.abort();
                        }
                    });
                }
                // No runtime left to wait on.
                Err(_) => graceful.iter().for_each(AbortHandle::abort),
            }
        }
        debug!("transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_none()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// What happened to a chunk handed to [`OutboundSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Session not connected; chunk discarded.
    NotConnected,
    /// Network side is behind; chunk discarded.
    QueueFull,
}

/// Non-blocking hand-off from the capture thread to the writer task.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<EncodedChunk>,
    connected: Arc<AtomicBool>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl OutboundSender {
    pub fn new(
        tx: mpsc::Sender<EncodedChunk>,
        connected: Arc<AtomicBool>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            tx,
            connected,
            diagnostics,
        }
    }

    /// # Errors
    /// `ParleyError::Transport` when the writer is gone while the session
    /// still believes it is connected.
    pub fn send(&self, chunk: EncodedChunk) -> Result<SendOutcome> {
        if !self.connected.load(Ordering::Acquire) {
            SessionDiagnostics::bump(&self.diagnostics.chunks_dropped);
            return Ok(SendOutcome::NotConnected);
        }

        match self.tx.try_send(chunk) {
            Ok(()) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_sent);
                Ok(SendOutcome::Queued)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_dropped);
                warn!("outbound queue full, dropping audio frame");
                Ok(SendOutcome::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_dropped);
                if self.connected.load(Ordering::Acquire) {
                    Err(ParleyError::Transport("outbound channel closed".into()))
                } else {
                    Ok(SendOutcome::NotConnected)
                }
            }
        }
    }
}
