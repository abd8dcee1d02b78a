//! Device threads.
//!
//! `cpal::Stream` is `!Send`, so each stream lives on its own
//! `spawn_blocking` thread for its whole life:
//!
//! - **input thread**: opens the microphone, then runs the capture loop until
//!   `running` is cleared, then drops the stream.
//! - **output thread**: opens the speaker, hands the timeline control back,
//!   then parks until released.
//!
//! Open results come back through oneshot channels so `acquire` can await
//! both devices together. Both threads are told to stop whenever the
//! [`StopSignal`] goes away, including when the `acquire` future or the
//! [`DeviceSet`] is dropped without an explicit release.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    audio::AudioBackend,
    buffering::create_audio_ring,
    config::AudioConfig,
    error::{ParleyError, Result},
    playback::{timeline::TimelineControl, ItemId},
    session::{
        capture::{self, CaptureContext},
        diagnostics::SessionDiagnostics,
    },
    transport::OutboundSender,
};

pub(crate) struct DeviceRequest {
    pub backend: Arc<dyn AudioBackend>,
    pub audio: AudioConfig,
    pub running: Arc<AtomicBool>,
    pub outbound: OutboundSender,
    pub diagnostics: Arc<SessionDiagnostics>,
    pub completions: mpsc::UnboundedSender<ItemId>,
    pub faults: mpsc::UnboundedSender<String>,
}

/// Tells both device threads to wind down. Fires at most once.
struct StopSignal {
    running: Arc<AtomicBool>,
    release: Option<crossbeam_channel::Sender<()>>,
}

impl StopSignal {
    fn fire(&mut self) {
        self.running.store(false, Ordering::Release);
        // Dropping the sender wakes the output thread.
        self.release.take();
    }
}

impl Drop for StopSignal {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Both device threads of a live session.
pub(crate) struct DeviceSet {
    sink: TimelineControl,
    stop: StopSignal,
    threads: Vec<JoinHandle<()>>,
}

impl DeviceSet {
    pub(crate) fn sink(&self) -> TimelineControl {
        self.sink.clone()
    }

    /// Stop capture, close both streams and wait for the threads to exit.
    /// Idempotent. Dropping the set stops the threads without waiting.
    pub(crate) async fn release(&mut self) {
        self.stop.fire();
        for thread in self.threads.drain(..) {
            if let Err(e) = thread.await {
                warn!("device thread ended abnormally: {e}");
            }
        }
    }
}

/// Open microphone and speaker concurrently.
///
/// On failure whatever did open is released before returning. An input
/// failure is reported in preference to an output failure.
pub(crate) async fn acquire(request: DeviceRequest) -> Result<DeviceSet> {
    let DeviceRequest {
        backend,
        audio,
        running,
        outbound,
        diagnostics,
        completions,
        faults,
    } = request;

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let mut stop = StopSignal {
        running: Arc::clone(&running),
        release: Some(release_tx),
    };

    let (input_tx, input_rx) = oneshot::channel::<Result<u32>>();
    let input_thread = {
        let backend = Arc::clone(&backend);
        let running = Arc::clone(&running);
        let preferred = audio.preferred_input_device.clone();
        let faults = faults.clone();
        let target_sample_rate = audio.capture_sample_rate;
        let block_size = audio.capture_block_size;
        tokio::task::spawn_blocking(move || {
            let (producer, consumer) = create_audio_ring();
            let guard = match backend.open_input(
                producer,
                Arc::clone(&running),
                preferred.as_deref(),
                faults.clone(),
            ) {
                Ok(guard) => guard,
                Err(e) => {
                    let _ = input_tx.send(Err(e));
                    return;
                }
            };
            let _ = input_tx.send(Ok(guard.sample_rate));

            capture::run(CaptureContext {
                consumer,
                running,
                device_sample_rate: guard.sample_rate,
                target_sample_rate,
                block_size,
                outbound,
                diagnostics,
                faults,
            });
            drop(guard);
            debug!("input device released");
        })
    };

    let (output_tx, output_rx) = oneshot::channel::<Result<TimelineControl>>();
    let output_thread = {
        let preferred = audio.preferred_output_device.clone();
        let preferred_rate = audio.playback_sample_rate;
        tokio::task::spawn_blocking(move || {
            match backend.open_output(preferred.as_deref(), preferred_rate, completions, faults) {
                Ok((guard, control)) => {
                    let _ = output_tx.send(Ok(control));
                    // Returns on release or when the sender is dropped.
                    let _ = release_rx.recv();
                    drop(guard);
                    debug!("output device released");
                }
                Err(e) => {
                    let _ = output_tx.send(Err(e));
                }
            }
        })
    };

    let (input, output) = tokio::join!(input_rx, output_rx);
    let input = input.unwrap_or_else(|_| Err(thread_exited("input")));
    let output = output.unwrap_or_else(|_| Err(thread_exited("output")));

    let error = match (input, output) {
        (Ok(input_rate), Ok(sink)) => {
            debug!(input_rate, "audio devices open");
            return Ok(DeviceSet {
                sink,
                stop,
                threads: vec![input_thread, output_thread],
            });
        }
        (Err(e), _) | (Ok(_), Err(e)) => e,
    };

    stop.fire();
    for thread in [input_thread, output_thread] {
        let _ = thread.await;
    }
    Err(error)
}

fn thread_exited(which: &str) -> ParleyError {
    ParleyError::AudioDevice(format!("{which} device thread exited before reporting"))
}
