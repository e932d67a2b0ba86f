//! Playback pipeline
//!
//! Server audio is appended to a single lock-protected buffer. A drain task
//! wakes every 80ms, asks the sink how much it can take without blocking,
//! and writes that much (rounded down to whole frames).

use crate::audio::{frame_align, AudioDevices, OutputDevice, OutputTarget};
use crate::error::AudioError;
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DRAIN_INTERVAL: Duration = Duration::from_millis(80);

/// Bound on waiting for a cancelled drain task
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on waiting for the sink to play out at finish
const FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Called once when a turn's audio has been played out
pub type FinishedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Bytes awaiting playback
#[derive(Debug, Default)]
pub struct PlaybackBuffer {
    data: Vec<u8>,
    appended: u64,
    drained: u64,
    discarded: u64,
}

impl PlaybackBuffer {
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.appended += bytes.len() as u64;
    }

    /// Remove up to `max` bytes, rounded down to whole frames
    pub fn take_aligned(&mut self, max: usize) -> Vec<u8> {
        let n = frame_align(max.min(self.data.len()));
        self.drained += n as u64;
        self.data.drain(..n).collect()
    }

    /// Discard everything buffered
    pub fn clear(&mut self) {
        self.discarded += self.data.len() as u64;
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn drained(&self) -> u64 {
        self.drained
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

/// Sink used when the real one cannot be opened or fails
struct DiscardSink;

#[async_trait::async_trait]
impl OutputDevice for DiscardSink {
    fn available(&self) -> usize {
        usize::MAX
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, AudioError> {
        Ok(bytes.len())
    }

    async fn flush(&mut self) {}

    async fn drain(&mut self) {}

    async fn close(&mut self) {}
}

struct DrainTask {
    cancel: CancellationToken,
    finish_tx: Option<oneshot::Sender<Vec<u8>>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Tasks {
    /// Task draining the current turn
    active: Option<DrainTask>,
    /// Tasks playing out a finished turn
    finishing: Vec<DrainTask>,
}

/// The speak pipeline
pub struct AudioPlayback {
    devices: Arc<dyn AudioDevices>,
    target: Mutex<OutputTarget>,
    buffer: Arc<Mutex<PlaybackBuffer>>,
    enabled: AtomicBool,
    tasks: tokio::sync::Mutex<Tasks>,
}

impl AudioPlayback {
    pub fn new(devices: Arc<dyn AudioDevices>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            target: Mutex::new(OutputTarget::default()),
            buffer: Arc::new(Mutex::new(PlaybackBuffer::default())),
            enabled: AtomicBool::new(true),
            tasks: tokio::sync::Mutex::new(Tasks::default()),
        })
    }

    /// Select where the next turn plays
    pub fn set_target(&self, target: OutputTarget) {
        *lock(&self.target) = target;
    }

    pub fn target(&self) -> OutputTarget {
        *lock(&self.target)
    }

    /// Start playing a new turn, discarding whatever was playing
    ///
    /// `on_finished` runs once after [`finish`](Self::finish) has played out
    /// the turn. It is dropped without running if the turn is cancelled or
    /// stopped.
    pub async fn start(&self, on_finished: FinishedCallback) {
        let mut tasks = self.tasks.lock().await;
        stop_all(&mut tasks).await;
        lock(&self.buffer).clear();

        let target = self.target();
        let sink: Box<dyn OutputDevice> = match self.devices.open_output(target) {
            Ok(sink) => sink,
            Err(e) => {
                tracing::warn!("Cannot open {} for playback, discarding audio: {}", target, e);
                Box::new(DiscardSink)
            }
        };

        let cancel = CancellationToken::new();
        let (finish_tx, finish_rx) = oneshot::channel();
        let task = tokio::spawn(drain_loop(
            self.buffer.clone(),
            sink,
            cancel.clone(),
            finish_rx,
            on_finished,
        ));

        tasks.active = Some(DrainTask {
            cancel,
            finish_tx: Some(finish_tx),
            task,
        });
        tracing::debug!("Playback started on {}", target);
    }

    /// Append turn audio; dropped while playback is stopped
    pub fn write(&self, bytes: &[u8]) {
        if !self.enabled.load(Ordering::SeqCst) {
            tracing::trace!("Playback disabled, dropping {} bytes", bytes.len());
            return;
        }
        lock(&self.buffer).append(bytes);
    }

    /// Discard buffered audio and end the turn without running its callback
    pub async fn cancel(&self) {
        let mut tasks = self.tasks.lock().await;
        stop_all(&mut tasks).await;
        lock(&self.buffer).clear();
    }

    /// Play out the remainder of the turn, then run its callback
    ///
    /// Returns without waiting for the audio to play.
    pub async fn finish(&self) {
        let mut tasks = self.tasks.lock().await;
        let Some(mut drain) = tasks.active.take() else {
            tracing::debug!("Playback finish with no active turn");
            return;
        };

        let remainder = {
            let mut buffer = lock(&self.buffer);
            let len = buffer.len();
            let aligned = buffer.take_aligned(len);
            buffer.clear();
            aligned
        };

        if let Some(finish_tx) = drain.finish_tx.take() {
            let _ = finish_tx.send(remainder);
        }
        tasks.finishing.retain(|t| !t.task.is_finished());
        tasks.finishing.push(drain);
    }

    /// Stop playback: discard the buffer and the sink, refuse new writes
    pub async fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        stop_all(&mut tasks).await;
        lock(&self.buffer).clear();
        tracing::debug!("Playback stopped");
    }

    /// Allow writes again after [`stop`](Self::stop)
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether a turn is currently accepting audio
    pub async fn is_active(&self) -> bool {
        self.tasks.lock().await.active.is_some()
    }

    /// Snapshot of (appended, drained, discarded, remaining) byte counts
    pub fn counters(&self) -> (u64, u64, u64, usize) {
        let buffer = lock(&self.buffer);
        (
            buffer.appended(),
            buffer.drained(),
            buffer.discarded(),
            buffer.len(),
        )
    }
}

async fn stop_all(tasks: &mut Tasks) {
    let mut stopping: Vec<DrainTask> = tasks.finishing.drain(..).collect();
    stopping.extend(tasks.active.take());

    for drain in stopping {
        drain.cancel.cancel();
        let mut task = drain.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("Playback drain task did not stop, aborting it");
            task.abort();
        }
    }
}

async fn drain_loop(
    buffer: Arc<Mutex<PlaybackBuffer>>,
    mut sink: Box<dyn OutputDevice>,
    cancel: CancellationToken,
    mut finish_rx: oneshot::Receiver<Vec<u8>>,
    on_finished: FinishedCallback,
) {
    let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let remainder = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                sink.flush().await;
                sink.close().await;
                return;
            }
            finish = &mut finish_rx => match finish {
                Ok(remainder) => break remainder,
                // Owner went away without finishing
                Err(_) => {
                    sink.flush().await;
                    sink.close().await;
                    return;
                }
            },
            _ = ticker.tick() => {
                let chunk = {
                    let available = sink.available();
                    lock(&buffer).take_aligned(available)
                };
                if !chunk.is_empty() {
                    write_or_discard(&mut sink, &chunk).await;
                }
            }
        }
    };

    if !remainder.is_empty() {
        write_or_discard(&mut sink, &remainder).await;
    }

    let played = tokio::select! {
        _ = cancel.cancelled() => false,
        result = tokio::time::timeout(FINISH_TIMEOUT, sink.drain()) => {
            if result.is_err() {
                tracing::warn!("Playback did not drain within {:?}", FINISH_TIMEOUT);
            }
            true
        }
    };

    if !played {
        sink.flush().await;
    }
    sink.close().await;

    if played {
        tracing::debug!("Playback finished");
        on_finished();
    }
}

async fn write_or_discard(sink: &mut Box<dyn OutputDevice>, bytes: &[u8]) {
    if let Err(e) = sink.write(bytes).await {
        tracing::warn!("Playback sink failed, discarding the rest of the turn: {}", e);
        sink.close().await;
        *sink = Box::new(DiscardSink);
    }
}
