//! Session controller.
//!
//! [`ParleySession`] is the handle the host holds. `connect` brings up both
//! devices and the transport concurrently, then spawns one event-loop task
//! that owns the conversation's [`SessionState`] until it ends.
//!
//! ```text
//!   commands ────────┐
//!   transport events ┤  select! (biased)  ──► SessionState::handle ──► StatusBoard
//!   completions ─────┤                              │                 (broadcast)
//!   device faults ───┘                              ▼
//!                                           PlaybackScheduler
//! ```
//!
//! Nothing but the event loop touches the scheduler, so a completion that
//! races an interrupt is simply a stale id.

mod capture;
mod devices;
pub mod diagnostics;
pub mod phase;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    audio::{device::DeviceInfo, AudioBackend, CpalBackend},
    config::{AudioConfig, SessionConfig},
    error::{ParleyError, Result},
    ipc::events::{
        ConnectionStatus, ConnectionStatusEvent, ModelTextEvent, SpeakingStateEvent,
    },
    playback::{timeline::TimelineControl, ItemId, PlaybackScheduler},
    transport::{
        GeminiLiveTransport, OutboundSender, TransportEvent, TransportHandle, TransportLink,
        VoiceTransport,
    },
};

use self::{
    devices::{DeviceRequest, DeviceSet},
    diagnostics::{DiagnosticsSnapshot, SessionDiagnostics},
    phase::{PhaseTrigger, SessionPhase},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Current phase plus the broadcast channels that announce changes to it.
pub(crate) struct StatusBoard {
    phase: Mutex<SessionPhase>,
    status_tx: broadcast::Sender<ConnectionStatusEvent>,
    speaking_tx: broadcast::Sender<SpeakingStateEvent>,
    text_tx: broadcast::Sender<ModelTextEvent>,
    seq: AtomicU64,
}

impl StatusBoard {
    fn new() -> Self {
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (speaking_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (text_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            phase: Mutex::new(SessionPhase::Idle),
            status_tx,
            speaking_tx,
            text_tx,
            seq: AtomicU64::new(0),
        }
    }

    fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    fn transition(&self, trigger: PhaseTrigger) -> SessionPhase {
        self.transition_with(trigger, None)
    }

    /// Apply `trigger` and announce whatever changed. `detail` is attached to
    /// the connection status event, if one is sent.
    fn transition_with(&self, trigger: PhaseTrigger, detail: Option<String>) -> SessionPhase {
        let (old, new) = {
            let mut phase = self.phase.lock();
            let old = *phase;
            *phase = old.apply(trigger);
            (old, *phase)
        };
        if old == new {
            return new;
        }
        debug!(from = %old, to = %new, ?trigger, "phase changed");

        if let Some(status) = new.connection_status() {
            if old.connection_status() != Some(status) {
                let _ = self
                    .status_tx
                    .send(ConnectionStatusEvent::new(status).with_detail(detail));
            }
        }
        if let Some(state) = new.speaking_state() {
            if old.speaking_state() != Some(state) {
                let _ = self.speaking_tx.send(SpeakingStateEvent {
                    seq: self.next_seq(),
                    state,
                });
            }
        }
        new
    }

    fn text(&self, text: String) {
        let _ = self.text_tx.send(ModelTextEvent {
            seq: self.next_seq(),
            text,
        });
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// The top-level session handle.
///
/// `ParleySession` is `Send + Sync`; wrap it in an `Arc` to share between the
/// host's command handlers and event forwarders. One conversation runs at a
/// time; a new one may start once the previous one has ended.
pub struct ParleySession {
    transport: Arc<dyn VoiceTransport>,
    backend: Arc<dyn AudioBackend>,
    audio: AudioConfig,
    board: Arc<StatusBoard>,
    diagnostics: Arc<SessionDiagnostics>,
    slot: Mutex<Slot>,
}

/// What the handle currently owns. The lock is never held across an await.
enum Slot {
    Idle,
    /// A `connect` is in flight; sending an ack sender cancels it and the
    /// ack fires once it has unwound.
    Connecting(oneshot::Sender<oneshot::Sender<()>>),
    Running(ActiveSession),
}

struct ActiveSession {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

enum Command {
    Disconnect(oneshot::Sender<()>),
}

/// Puts the handle back to rest if a `connect` future is dropped before it
/// settles. Devices and transport clean up through their own `Drop`.
struct PendingConnect<'a> {
    slot: &'a Mutex<Slot>,
    board: &'a StatusBoard,
    armed: bool,
}

impl PendingConnect<'_> {
    /// Settle the pending connect: free the slot and apply `trigger`.
    fn settle(mut self, trigger: PhaseTrigger, detail: Option<String>) {
        self.armed = false;
        self.release_slot();
        self.board.transition_with(trigger, detail);
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    fn release_slot(&self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Connecting(_)) {
            *slot = Slot::Idle;
        }
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("connect abandoned before the session came up");
            self.release_slot();
            self.board.transition_with(
                PhaseTrigger::Closed,
                Some(ParleyError::Cancelled.to_string()),
            );
        }
    }
}

impl ParleySession {
    pub fn new(
        transport: Arc<dyn VoiceTransport>,
        backend: Arc<dyn AudioBackend>,
        audio: AudioConfig,
    ) -> Self {
        Self {
            transport,
            backend,
            audio,
            board: Arc::new(StatusBoard::new()),
            diagnostics: Arc::new(SessionDiagnostics::default()),
            slot: Mutex::new(Slot::Idle),
        }
    }

    /// Gemini Live over the system audio devices.
    pub fn gemini(api_key: impl Into<String>, audio: AudioConfig) -> Self {
        Self::new(
            Arc::new(GeminiLiveTransport::new(api_key)),
            Arc::new(CpalBackend),
            audio,
        )
    }

    /// Start a conversation.
    ///
    /// Resolves once the microphone, the speaker and the remote session are
    /// all up, or after everything acquired so far has been released again.
    /// Dropping the future before it resolves leaves the session
    /// disconnected.
    ///
    /// # Errors
    /// - `AlreadyConnected` while a conversation is starting or running.
    /// - A device error (`AudioDevice`, `AudioStream`, `NoDefault*Device`),
    ///   reported in preference to a simultaneous `Connect` error.
    /// - `Connect` when the remote session could not be established.
    /// - `Cancelled` when [`disconnect`](Self::disconnect) ran first.
    pub async fn connect(&self, config: SessionConfig) -> Result<()> {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let previous = {
            let mut slot = self.slot.lock();
            if self.board.phase().is_active() {
                return Err(ParleyError::AlreadyConnected);
            }
            self.diagnostics.reset();
            self.board.transition(PhaseTrigger::Connect);
            std::mem::replace(&mut *slot, Slot::Connecting(cancel_tx))
        };
        let pending = PendingConnect {
            slot: &self.slot,
            board: &self.board,
            armed: true,
        };
        // A conversation that ended remotely leaves its finished task behind.
        if let Slot::Running(previous) = previous {
            let _ = previous.task.await;
        }

        let span = info_span!("session", voice = %config.response_voice);
        info!(parent: &span, model = config.model.as_str(), "connecting");

        let (outbound_tx, outbound_rx) = mpsc::channel(self.audio.outbound_queue.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let request = DeviceRequest {
            backend: Arc::clone(&self.backend),
            audio: self.audio.clone(),
            running: Arc::new(AtomicBool::new(true)),
            outbound: OutboundSender::new(
                outbound_tx,
                Arc::clone(&connected),
                Arc::clone(&self.diagnostics),
            ),
            diagnostics: Arc::clone(&self.diagnostics),
            completions: completions_tx,
            faults: faults_tx,
        };
        let link = TransportLink {
            outbound: outbound_rx,
            events: events_tx,
        };

        // Dropping the join on cancel drops whatever half already came up;
        // `DeviceSet` and `TransportHandle` stop themselves on drop.
        let joined = tokio::select! {
            biased;
            ack = &mut cancel_rx => Err(ack.ok()),
            pair = async {
                tokio::join!(
                    devices::acquire(request),
                    self.transport.connect(&config, link)
                )
            } => Ok(pair),
        };
        let (devices, transport) = match joined {
            Ok(pair) => pair,
            Err(ack) => {
                info!(parent: &span, "connect cancelled");
                pending.settle(PhaseTrigger::Closed, None);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return Err(ParleyError::Cancelled);
            }
        };

        let (devices, transport) = match (devices, transport) {
            (Ok(devices), Ok(transport)) => (devices, transport),
            (Err(e), transport) => {
                if let Ok(mut handle) = transport {
                    handle.close();
                }
                return Err(abort_connect(pending, &span, e));
            }
            (Ok(mut devices), Err(e)) => {
                devices.release().await;
                return Err(abort_connect(pending, &span, e));
            }
        };

        let state = SessionState {
            scheduler: PlaybackScheduler::new(devices.sink()),
            devices,
            transport,
            connected: Arc::clone(&connected),
            board: Arc::clone(&self.board),
            diagnostics: Arc::clone(&self.diagnostics),
        };

        // `disconnect` may have taken the slot after the join resolved.
        let superseded = {
            let mut slot = self.slot.lock();
            if matches!(*slot, Slot::Connecting(_)) {
                connected.store(true, Ordering::Release);
                self.board.transition(PhaseTrigger::Ready);
                info!(parent: &span, "connected");

                let (commands_tx, commands_rx) = mpsc::channel(4);
                let task = tokio::spawn(
                    run_event_loop(state, commands_rx, events_rx, completions_rx, faults_rx)
                        .instrument(span.clone()),
                );
                *slot = Slot::Running(ActiveSession {
                    commands: commands_tx,
                    task,
                });
                None
            } else {
                Some(state)
            }
        };
        match superseded {
            None => {
                pending.disarm();
                Ok(())
            }
            Some(state) => {
                info!(parent: &span, "connect cancelled after the session came up");
                state
                    .teardown(Ending::Local(cancel_rx.try_recv().ok()))
                    .instrument(span)
                    .await;
                pending.disarm();
                Err(ParleyError::Cancelled)
            }
        }
    }

    /// End the conversation and release every resource. Cancels a `connect`
    /// that is still in flight. A no-op when nothing is running.
    pub async fn disconnect(&self) -> Result<()> {
        let slot = std::mem::replace(&mut *self.slot.lock(), Slot::Idle);
        match slot {
            Slot::Idle => Ok(()),
            Slot::Connecting(cancel) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if cancel.send(ack_tx).is_ok() {
                    let _ = ack_rx.await;
                }
                Ok(())
            }
            Slot::Running(session) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                if session.commands.send(Command::Disconnect(ack_tx)).await.is_ok() {
                    let _ = ack_rx.await;
                }
                if let Err(e) = session.task.await {
                    warn!("session task ended abnormally: {e}");
                }
                Ok(())
            }
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.board.phase()
    }

    /// Connection status as the UI shows it; `Idle` reads as disconnected.
    pub fn status(&self) -> ConnectionStatus {
        self.phase()
            .connection_status()
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatusEvent> {
        self.board.status_tx.subscribe()
    }

    pub fn subscribe_speaking(&self) -> broadcast::Receiver<SpeakingStateEvent> {
        self.board.speaking_tx.subscribe()
    }

    pub fn subscribe_text(&self) -> broadcast::Receiver<ModelTextEvent> {
        self.board.text_tx.subscribe()
    }

    /// Counters of the current (or last) conversation.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn audio_config(&self) -> &AudioConfig {
        &self.audio
    }

    pub fn input_devices(&self) -> Vec<DeviceInfo> {
        self.backend.input_devices()
    }

    pub fn output_devices(&self) -> Vec<DeviceInfo> {
        self.backend.output_devices()
    }

}

fn abort_connect(
    pending: PendingConnect<'_>,
    span: &tracing::Span,
    error: ParleyError,
) -> ParleyError {
    let stage = if error.is_device_error() { "devices" } else { "transport" };
    error!(parent: span, stage, "connect failed: {error}");
    pending.settle(PhaseTrigger::Failed, Some(error.to_string()));
    error
}

/// Everything one conversation owns. Lives inside the event-loop task.
pub(crate) struct SessionState {
    scheduler: PlaybackScheduler<TimelineControl>,
    devices: DeviceSet,
    transport: TransportHandle,
    connected: Arc<AtomicBool>,
    board: Arc<StatusBoard>,
    diagnostics: Arc<SessionDiagnostics>,
}

/// One input to the event loop.
enum SessionEvent {
    Disconnect(Option<oneshot::Sender<()>>),
    Transport(TransportEvent),
    PlaybackComplete(ItemId),
    DeviceFault(String),
}

/// Why a conversation ended.
enum Ending {
    Local(Option<oneshot::Sender<()>>),
    Remote(Option<String>),
    Failed(ParleyError),
}

impl SessionState {
    /// Apply one event. Returns `Some` when the conversation must end.
    fn handle(&mut self, event: SessionEvent) -> Option<Ending> {
        match event {
            SessionEvent::Disconnect(ack) => Some(Ending::Local(ack)),
            SessionEvent::Transport(event) => self.handle_transport(event),
            SessionEvent::PlaybackComplete(id) => {
                if self.scheduler.complete(id) {
                    debug!(%id, "playback idle");
                    self.board.transition(PhaseTrigger::PlaybackIdle);
                }
                None
            }
            SessionEvent::DeviceFault(cause) => {
                Some(Ending::Failed(ParleyError::AudioStream(cause)))
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) -> Option<Ending> {
        match event {
            TransportEvent::AudioChunk(chunk) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_received);
                match self.scheduler.enqueue(&chunk) {
                    Ok(Some(_)) => {
                        SessionDiagnostics::bump(&self.diagnostics.chunks_scheduled);
                        self.board.transition(PhaseTrigger::AudioScheduled);
                    }
                    Ok(None) => debug!("nothing scheduled for this chunk"),
                    Err(e) => {
                        SessionDiagnostics::bump(&self.diagnostics.codec_errors);
                        warn!("dropping malformed audio chunk: {e}");
                    }
                }
                None
            }
            TransportEvent::Interrupted => {
                let stopped = self.scheduler.interrupt();
                SessionDiagnostics::bump(&self.diagnostics.interrupts);
                info!(stopped, "model interrupted");
                self.board.transition(PhaseTrigger::Interrupted);
                None
            }
            TransportEvent::TurnComplete => {
                if self.scheduler.flush().is_some() {
                    self.board.transition(PhaseTrigger::AudioScheduled);
                }
                debug!(queued = self.scheduler.active_len(), "model turn complete");
                None
            }
            TransportEvent::Text(text) => {
                self.board.text(text);
                None
            }
            TransportEvent::Closed(reason) => Some(Ending::Remote(reason)),
            TransportEvent::Error(cause) => Some(Ending::Failed(ParleyError::Transport(cause))),
        }
    }

    /// Release everything, then publish the final phase.
    async fn teardown(mut self, ending: Ending) {
        self.connected.store(false, Ordering::Release);
        self.scheduler.reset();
        self.transport.close();
        self.devices.release().await;

        match ending {
            Ending::Local(ack) => {
                self.board.transition(PhaseTrigger::Closed);
                info!("disconnected");
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Ending::Remote(reason) => {
                info!(reason = reason.as_deref().unwrap_or(""), "remote closed the session");
                self.board.transition_with(PhaseTrigger::Closed, reason);
            }
            Ending::Failed(e) => {
                error!("session failed: {e}");
                self.board
                    .transition_with(PhaseTrigger::Failed, Some(e.to_string()));
            }
        }

        info!(diagnostics = ?self.diagnostics.snapshot(), "session ended");
    }
}

async fn run_event_loop(
    mut state: SessionState,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut completions: mpsc::UnboundedReceiver<ItemId>,
    mut faults: mpsc::UnboundedReceiver<String>,
) {
    let ending = loop {
        let event = tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(Command::Disconnect(ack)) => SessionEvent::Disconnect(Some(ack)),
                // Handle dropped without disconnecting.
                None => SessionEvent::Disconnect(None),
            },
            Some(cause) = faults.recv() => SessionEvent::DeviceFault(cause),
            event = events.recv() => SessionEvent::Transport(
                event.unwrap_or(TransportEvent::Closed(None)),
            ),
            Some(id) = completions.recv() => SessionEvent::PlaybackComplete(id),
        };

        if let Some(ending) = state.handle(event) {
            break ending;
        }
    };

    state.teardown(ending).await;
}
