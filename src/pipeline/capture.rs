//! Capture pipeline
//!
//! One capture at a time reads the selected input device and forwards each
//! chunk to the server as `audio_data`, framed by `audio_start` and
//! `audio_end` under a fresh id. A new capture cancels and joins the old one.

use crate::audio::{AudioDevices, InputSource};
use crate::control::{StatusPush, StatusSink};
use crate::protocol::ClientAction;
use crate::status::StatusIndicator;
use crate::sync::lock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Seconds of audio one capture may send
const CAPTURE_WINDOW_SECS: usize = 10;

/// Wall-clock limit of one capture
const CAPTURE_WALL_LIMIT: Duration = Duration::from_secs(12);

const READ_TIMEOUT: Duration = Duration::from_millis(300);
/// Pause after an empty read; a full run of empty reads fits inside the wall limit
const EMPTY_READ_PAUSE: Duration = Duration::from_millis(50);
const MAX_EMPTY_READS: u32 = 200;

/// How long a new capture waits for the previous one to wind down
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Session side of a capture
#[async_trait::async_trait]
pub trait CaptureHost: Send + Sync + 'static {
    /// Whether the server link is READY
    fn is_ready(&self) -> bool;

    /// Queue a message for the server; false if the link is not open
    fn send_to_server(&self, action: ClientAction) -> bool;

    /// The capture ended on its own (not replaced by a newer capture)
    async fn on_capture_finished(&self);
}

struct ActiveCapture {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct CaptureSettings {
    source: InputSource,
    stt_options: Option<Value>,
}

/// Counters for messages written to the server during one capture
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    pub count: usize,
    pub bytes: usize,
}

impl WriteSummary {
    fn record(&mut self, bytes: usize) {
        self.count += 1;
        self.bytes += bytes;
    }

    pub fn average(&self) -> usize {
        if self.count > 0 {
            self.bytes / self.count
        } else {
            0
        }
    }
}

/// The listen pipeline
pub struct AudioCapture {
    devices: Arc<dyn AudioDevices>,
    status: Arc<dyn StatusSink>,
    indicator: Arc<dyn StatusIndicator>,
    log_audio_info: bool,
    settings: Mutex<CaptureSettings>,
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
    current: Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    open: AtomicBool,
}

impl AudioCapture {
    pub fn new(
        devices: Arc<dyn AudioDevices>,
        status: Arc<dyn StatusSink>,
        indicator: Arc<dyn StatusIndicator>,
        log_audio_info: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            status,
            indicator,
            log_audio_info,
            settings: Mutex::new(CaptureSettings::default()),
            active: tokio::sync::Mutex::new(None),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            open: AtomicBool::new(false),
        })
    }

    fn settings(&self) -> MutexGuard<'_, CaptureSettings> {
        lock(&self.settings)
    }

    fn current(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        lock(&self.current)
    }

    /// Select the device the next capture reads from
    pub fn set_input_source(&self, source: InputSource) {
        self.settings().source = source;
    }

    pub fn input_source(&self) -> InputSource {
        self.settings().source
    }

    /// Queue STT options for the next `audio_start`
    pub fn set_stt_options(&self, options: Option<Value>) {
        self.settings().stt_options = options;
    }

    /// Whether a capture currently has its device open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Ask the running capture to stop; does not wait for it
    pub fn close(&self) {
        if let Some(cancel) = self.current().as_ref() {
            cancel.cancel();
        }
    }

    /// Start a new capture, cancelling and joining any capture in flight
    pub async fn capture(self: &Arc<Self>, host: Arc<dyn CaptureHost>) {
        let mut active = self.active.lock().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(previous) = active.take() {
            previous.cancel.cancel();
            let mut task = previous.task;
            if tokio::time::timeout(JOIN_TIMEOUT, &mut task).await.is_err() {
                tracing::warn!("Previous capture did not stop within {:?}", JOIN_TIMEOUT);
                task.abort();
            }
        }

        let cancel = CancellationToken::new();
        *self.current() = Some(cancel.clone());

        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            this.run(host, token, generation).await;
        });

        *active = Some(ActiveCapture { cancel, task });
    }

    /// Cancel and join the capture in flight, without notifying the host
    pub async fn shutdown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = self.active.lock().await.take() {
            previous.cancel.cancel();
            let mut task = previous.task;
            if tokio::time::timeout(JOIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    async fn run(self: Arc<Self>, host: Arc<dyn CaptureHost>, cancel: CancellationToken, generation: u64) {
        let source = self.input_source();

        let mut device = match self.devices.open_input(source) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!("Capture aborted, {} unavailable: {}", source, e);
                self.finish(&host, generation).await;
                return;
            }
        };

        self.open.store(true, Ordering::SeqCst);
        self.status.push(StatusPush::MicOpen);
        tracing::debug!("Capture started from {}", source);

        let mut remaining = CAPTURE_WINDOW_SECS * device.data_rate();
        let started = Instant::now();
        let mut summary = WriteSummary::default();

        let mut turn_id = None;
        if host.is_ready() {
            let stt = self.settings().stt_options.take();
            let start = ClientAction::audio_start(stt);
            let id = start.id().to_string();
            if host.send_to_server(start) {
                turn_id = Some(id);
            }
        }

        self.indicator.on();

        let mut buf = vec![0u8; device.buffer_size().max(1)];
        let mut empty_reads = 0u32;

        while let Some(id) = turn_id.as_deref() {
            if cancel.is_cancelled()
                || !host.is_ready()
                || remaining == 0
                || empty_reads >= MAX_EMPTY_READS
                || started.elapsed() >= CAPTURE_WALL_LIMIT
            {
                break;
            }

            let want = buf.len().min(remaining);
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = device.read(&mut buf[..want], READ_TIMEOUT) => read,
            };

            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Capture read failed: {}", e);
                    break;
                }
            };

            if n == 0 {
                empty_reads += 1;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(EMPTY_READ_PAUSE) => {}
                }
                continue;
            }

            empty_reads = 0;
            remaining = remaining.saturating_sub(n);
            if host.send_to_server(ClientAction::audio_data(id, &buf[..n])) {
                summary.record(n);
            }
        }

        self.indicator.off();

        if self.log_audio_info {
            tracing::info!(
                "Wrote to server. Times: {} Total Bytes: {} Avg: {}",
                summary.count,
                summary.bytes,
                summary.average()
            );
        } else {
            tracing::debug!(
                "Wrote to server. Times: {} Total Bytes: {} Avg: {}",
                summary.count,
                summary.bytes,
                summary.average()
            );
        }

        if let Some(id) = turn_id {
            if host.is_ready() {
                host.send_to_server(ClientAction::audio_end(&id));
            }
        }

        device.drain().await;
        device.release().await;

        self.open.store(false, Ordering::SeqCst);
        self.status.push(StatusPush::MicClose);
        tracing::debug!("Capture ended after {:?}", started.elapsed());

        self.finish(&host, generation).await;
    }

    /// Notify the host unless a newer capture has replaced this one
    async fn finish(&self, host: &Arc<dyn CaptureHost>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) == generation {
            host.on_capture_finished().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_summary_average() {
        let mut summary = WriteSummary::default();
        assert_eq!(summary.average(), 0);
        summary.record(100);
        summary.record(300);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.bytes, 400);
        assert_eq!(summary.average(), 200);
    }
}
