use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use parley_core::audio::{AudioBackend, StreamGuard};
use parley_core::buffering::{AudioProducer, Producer};
use parley_core::codec::{self, to_pcm16_le, EncodedChunk};
use parley_core::playback::{
    timeline::{timeline, TimelineControl},
    ItemId, OutputFormat,
};
use parley_core::session::phase::Speaking;
use parley_core::transport::{TransportHandle, TransportLink};
use parley_core::{
    AudioConfig, ConnectionStatus, ConnectionStatusEvent, ParleyError, ParleySession,
    SessionConfig, SessionPhase, SpeakingState, SpeakingStateEvent, TransportEvent,
    VoiceTransport,
};

const OUTPUT_RATE: u32 = 24_000;

// ── Scripted audio backend ──────────────────────────────────────────────────

/// Background thread standing in for a device callback. Stops on drop.
struct FakeStream {
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    released: Arc<AtomicUsize>,
}

impl FakeStream {
    fn spawn(released: Arc<AtomicUsize>, mut tick: impl FnMut() + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                tick();
                thread::sleep(Duration::from_millis(10));
            }
        });
        Self {
            stop,
            worker: Some(worker),
            released,
        }
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedBackend {
    fail_input: bool,
    fail_output: bool,
    /// Streams closed so far (input and output).
    released: Arc<AtomicUsize>,
    faults: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ScriptedBackend {
    fn inject_fault(&self, cause: &str) {
        if let Some(faults) = self.faults.lock().as_ref() {
            let _ = faults.send(cause.to_string());
        }
    }
}

impl AudioBackend for ScriptedBackend {
    fn open_input(
        &self,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        _preferred_device: Option<&str>,
        faults: mpsc::UnboundedSender<String>,
    ) -> parley_core::error::Result<StreamGuard> {
        if self.fail_input {
            return Err(ParleyError::NoDefaultInputDevice);
        }
        *self.faults.lock() = Some(faults);

        // 10 ms of 16 kHz audio per tick.
        let stream = FakeStream::spawn(Arc::clone(&self.released), move || {
            if running.load(Ordering::Relaxed) {
                producer.push_slice(&[0.1f32; 160]);
            }
        });
        Ok(StreamGuard::new(16_000, 1, stream))
    }

    fn open_output(
        &self,
        _preferred_device: Option<&str>,
        _preferred_rate: u32,
        completions: mpsc::UnboundedSender<ItemId>,
        _faults: mpsc::UnboundedSender<String>,
    ) -> parley_core::error::Result<(StreamGuard, TimelineControl)> {
        if self.fail_output {
            return Err(ParleyError::AudioDevice("speaker busy".into()));
        }

        let format = OutputFormat {
            sample_rate: OUTPUT_RATE,
            channels: 1,
        };
        let (control, mut renderer) = timeline(format, completions);
        let mut block = vec![0.0f32; (OUTPUT_RATE / 100) as usize];
        let stream = FakeStream::spawn(Arc::clone(&self.released), move || {
            renderer.render(&mut block);
        });
        Ok((StreamGuard::new(OUTPUT_RATE, 1, stream), control))
    }
}

// ── Scripted transport ──────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedTransport {
    fail: Mutex<Option<String>>,
    /// Never finish the handshake, like a server that accepts the socket
    /// and then goes quiet.
    hang: AtomicBool,
    outbound: Mutex<Option<mpsc::Receiver<EncodedChunk>>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedTransport {
    fn failing(cause: &str) -> Self {
        Self {
            fail: Mutex::new(Some(cause.to_string())),
            ..Self::default()
        }
    }

    fn hanging() -> Self {
        Self {
            hang: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn push(&self, event: TransportEvent) {
        let events = self.events.lock();
        events
            .as_ref()
            .expect("transport not connected")
            .send(event)
            .expect("session stopped listening");
    }

    fn take_outbound(&self) -> mpsc::Receiver<EncodedChunk> {
        self.outbound.lock().take().expect("transport not connected")
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceTransport for ScriptedTransport {
    async fn connect(
        &self,
        _config: &SessionConfig,
        link: TransportLink,
    ) -> parley_core::error::Result<TransportHandle> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(cause) = self.fail.lock().clone() {
            return Err(ParleyError::Connect(cause));
        }
        *self.outbound.lock() = Some(link.outbound);
        *self.events.lock() = Some(link.events);
        self.closed.store(false, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            let _ = shutdown_rx.await;
            closed.store(true, Ordering::SeqCst);
        });
        Ok(TransportHandle::new(shutdown_tx, Vec::new()))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

struct Harness {
    session: Arc<ParleySession>,
    backend: Arc<ScriptedBackend>,
    transport: Arc<ScriptedTransport>,
    status: broadcast::Receiver<ConnectionStatusEvent>,
    speaking: broadcast::Receiver<SpeakingStateEvent>,
}

fn harness(backend: ScriptedBackend, transport: ScriptedTransport) -> Harness {
    let backend = Arc::new(backend);
    let transport = Arc::new(transport);
    let session = Arc::new(ParleySession::new(
        Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        Arc::clone(&backend) as Arc<dyn AudioBackend>,
        AudioConfig::default(),
    ));
    let status = session.subscribe_status();
    let speaking = session.subscribe_speaking();
    Harness {
        session,
        backend,
        transport,
        status,
        speaking,
    }
}

async fn recv_with_timeout<T: Clone>(rx: &mut broadcast::Receiver<T>, timeout: Duration) -> T {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed unexpectedly")
}

async fn expect_status(h: &mut Harness, status: ConnectionStatus) -> ConnectionStatusEvent {
    let event = recv_with_timeout(&mut h.status, Duration::from_secs(3)).await;
    assert_eq!(event.status, status, "unexpected status event {event:?}");
    event
}

async fn expect_speaking(h: &mut Harness, state: SpeakingState) {
    let event = recv_with_timeout(&mut h.speaking, Duration::from_secs(3)).await;
    assert_eq!(event.state, state);
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() >= Duration::from_secs(3) {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn connect(h: &mut Harness) {
    h.session
        .connect(SessionConfig::default())
        .await
        .expect("connect");
    expect_status(h, ConnectionStatus::Connecting).await;
    expect_status(h, ConnectionStatus::Connected).await;
    expect_speaking(h, SpeakingState::Listening).await;
}

fn speech(seconds: f64) -> EncodedChunk {
    let samples = vec![0.2f32; (seconds * OUTPUT_RATE as f64) as usize];
    EncodedChunk::from_pcm_bytes(&to_pcm16_le(&samples), OUTPUT_RATE)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn microphone_frames_reach_the_transport_in_order() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;
    assert_eq!(h.session.phase(), SessionPhase::Connected(Speaking::Listening));

    let mut outbound = h.transport.take_outbound();
    for _ in 0..2 {
        let chunk = tokio::time::timeout(Duration::from_secs(3), outbound.recv())
            .await
            .expect("timed out waiting for a microphone frame")
            .expect("outbound channel closed");
        assert_eq!(chunk.mime_type(), "audio/pcm;rate=16000");
        let decoded = codec::decode(&chunk, 16_000, 1).expect("valid frame");
        assert_eq!(decoded.frames(), 4096);
    }

    h.session.disconnect().await.expect("disconnect");
    expect_status(&mut h, ConnectionStatus::Disconnected).await;
    assert!(h.session.diagnostics_snapshot().chunks_sent >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn model_turn_flips_speaking_state_until_playback_drains() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;

    h.transport.push(TransportEvent::AudioChunk(speech(0.1)));
    h.transport.push(TransportEvent::AudioChunk(speech(0.1)));
    h.transport.push(TransportEvent::TurnComplete);

    expect_speaking(&mut h, SpeakingState::ModelSpeaking).await;
    expect_speaking(&mut h, SpeakingState::Listening).await;

    let stats = h.session.diagnostics_snapshot();
    assert_eq!(stats.chunks_received, 2);
    assert_eq!(stats.chunks_scheduled, 2);

    h.session.disconnect().await.expect("disconnect");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_returns_to_listening_immediately() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;

    h.transport.push(TransportEvent::AudioChunk(speech(5.0)));
    expect_speaking(&mut h, SpeakingState::ModelSpeaking).await;

    h.transport.push(TransportEvent::Interrupted);
    let started = Instant::now();
    expect_speaking(&mut h, SpeakingState::Listening).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(h.session.diagnostics_snapshot().interrupts, 1);
    assert_eq!(h.session.status(), ConnectionStatus::Connected);

    // The next turn is scheduled fresh, not behind the discarded audio.
    h.transport.push(TransportEvent::AudioChunk(speech(0.1)));
    expect_speaking(&mut h, SpeakingState::ModelSpeaking).await;
    expect_speaking(&mut h, SpeakingState::Listening).await;

    h.session.disconnect().await.expect("disconnect");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_chunk_is_dropped_without_leaving_listening() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;

    // "AAAA" decodes to three bytes.
    h.transport.push(TransportEvent::AudioChunk(EncodedChunk::new(
        "audio/pcm;rate=24000",
        "AAAA",
    )));
    let session = &h.session;
    wait_until("codec error", || session.diagnostics_snapshot().codec_errors == 1).await;

    assert_eq!(h.session.phase(), SessionPhase::Connected(Speaking::Listening));
    assert!(h.speaking.try_recv().is_err());

    h.transport.push(TransportEvent::AudioChunk(speech(0.05)));
    expect_speaking(&mut h, SpeakingState::ModelSpeaking).await;

    h.session.disconnect().await.expect("disconnect");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn microphone_failure_aborts_connect_and_releases_the_rest() {
    let backend = ScriptedBackend {
        fail_input: true,
        ..ScriptedBackend::default()
    };
    let mut h = harness(backend, ScriptedTransport::default());

    let err = h
        .session
        .connect(SessionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::NoDefaultInputDevice));
    assert!(err.is_device_error());

    expect_status(&mut h, ConnectionStatus::Connecting).await;
    let event = expect_status(&mut h, ConnectionStatus::Error).await;
    assert!(event.detail.is_some());
    assert!(h.status.try_recv().is_err(), "exactly one error notification");

    assert_eq!(h.session.phase(), SessionPhase::Error);
    assert!(wait_closed(&h.transport).await);
    // The speaker did open and must have been closed again.
    assert_eq!(h.backend.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_error_wins_over_a_simultaneous_connect_error() {
    let backend = ScriptedBackend {
        fail_output: true,
        ..ScriptedBackend::default()
    };
    let mut h = harness(backend, ScriptedTransport::failing("401 unauthorized"));

    let err = h
        .session
        .connect(SessionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::AudioDevice(_)));
    expect_status(&mut h, ConnectionStatus::Connecting).await;
    expect_status(&mut h, ConnectionStatus::Error).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_failure_releases_devices_and_allows_a_retry() {
    let mut h = harness(
        ScriptedBackend::default(),
        ScriptedTransport::failing("401 unauthorized"),
    );

    let err = h
        .session
        .connect(SessionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::Connect(_)));
    expect_status(&mut h, ConnectionStatus::Connecting).await;
    let event = expect_status(&mut h, ConnectionStatus::Error).await;
    assert!(event.detail.unwrap_or_default().contains("401"));
    assert_eq!(h.backend.released.load(Ordering::SeqCst), 2);

    *h.transport.fail.lock() = None;
    connect(&mut h).await;
    h.session.disconnect().await.expect("disconnect");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_twice_is_rejected() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;

    let err = h
        .session
        .connect(SessionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::AlreadyConnected));
    assert!(h.session.phase().is_connected());

    h.session.disconnect().await.expect("disconnect");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_releases_everything_and_is_idempotent() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());

    // Nothing running yet.
    h.session.disconnect().await.expect("disconnect from idle");
    assert_eq!(h.session.phase(), SessionPhase::Idle);

    connect(&mut h).await;
    h.session.disconnect().await.expect("disconnect");
    expect_status(&mut h, ConnectionStatus::Disconnected).await;
    assert_eq!(h.session.phase(), SessionPhase::Disconnected);
    assert_eq!(h.backend.released.load(Ordering::SeqCst), 2);
    assert!(wait_closed(&h.transport).await);

    h.session.disconnect().await.expect("second disconnect");
    assert!(h.status.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_close_ends_in_disconnected() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;

    h.transport
        .push(TransportEvent::Closed(Some("session expired".into())));
    let event = expect_status(&mut h, ConnectionStatus::Disconnected).await;
    assert_eq!(event.detail.as_deref(), Some("session expired"));
    assert_eq!(h.backend.released.load(Ordering::SeqCst), 2);

    // Already over; disconnect has nothing left to do.
    h.session.disconnect().await.expect("disconnect");
    assert!(h.status.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_error_is_reported_once() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;

    h.transport
        .push(TransportEvent::Error("connection reset by peer".into()));
    let event = expect_status(&mut h, ConnectionStatus::Error).await;
    assert!(event
        .detail
        .unwrap_or_default()
        .contains("connection reset by peer"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.status.try_recv().is_err(), "exactly one error notification");
    assert_eq!(h.session.phase(), SessionPhase::Error);
    assert!(wait_closed(&h.transport).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_fault_mid_session_is_fatal() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::default());
    connect(&mut h).await;

    h.backend.inject_fault("microphone: device unplugged");
    let event = expect_status(&mut h, ConnectionStatus::Error).await;
    assert!(event.detail.unwrap_or_default().contains("unplugged"));
    assert_eq!(h.backend.released.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_connect_leaves_the_session_disconnected() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::hanging());

    let attempt = tokio::time::timeout(
        Duration::from_millis(300),
        h.session.connect(SessionConfig::default()),
    )
    .await;
    assert!(attempt.is_err(), "handshake should still be pending");

    expect_status(&mut h, ConnectionStatus::Connecting).await;
    let event = expect_status(&mut h, ConnectionStatus::Disconnected).await;
    assert_eq!(event.detail.as_deref(), Some("operation cancelled"));
    assert_eq!(h.session.phase(), SessionPhase::Disconnected);

    // Both devices opened during the handshake and must be closed again.
    let backend = Arc::clone(&h.backend);
    wait_until("both streams released", || {
        backend.released.load(Ordering::SeqCst) == 2
    })
    .await;

    h.session.disconnect().await.expect("nothing left to disconnect");
    h.transport.hang.store(false, Ordering::SeqCst);
    connect(&mut h).await;
    h.session.disconnect().await.expect("disconnect");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_cancels_a_stalled_handshake() {
    let mut h = harness(ScriptedBackend::default(), ScriptedTransport::hanging());

    let session = Arc::clone(&h.session);
    let attempt = tokio::spawn(async move { session.connect(SessionConfig::default()).await });
    expect_status(&mut h, ConnectionStatus::Connecting).await;

    tokio::time::timeout(Duration::from_secs(2), h.session.disconnect())
        .await
        .expect("disconnect waited for the handshake")
        .expect("disconnect");

    let result = attempt.await.expect("connect task panicked");
    assert!(matches!(result, Err(ParleyError::Cancelled)), "{result:?}");
    let event = expect_status(&mut h, ConnectionStatus::Disconnected).await;
    assert_eq!(event.detail, None);
    assert_eq!(h.session.phase(), SessionPhase::Disconnected);
    assert!(h.speaking.try_recv().is_err(), "never reached listening");

    let backend = Arc::clone(&h.backend);
    wait_until("both streams released", || {
        backend.released.load(Ordering::SeqCst) == 2
    })
    .await;
}

async fn wait_closed(transport: &ScriptedTransport) -> bool {
    wait_until("transport close", || transport.is_closed()).await;
    true
}
