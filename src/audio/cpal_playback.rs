//! cpal-based speaker playback
//!
//! Written PCM is converted to f32, resampled to the device rate and queued
//! in a shared buffer that the output callback pulls from. As with capture,
//! the stream itself lives on a dedicated thread.

use super::{match_device_name, pcm16_to_f32, resample, OutputDevice, DATA_RATE, SAMPLE_RATE};
use crate::error::AudioError;
use crate::sync::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Session bytes the speaker accepts ahead of playback (about one second)
const QUEUE_CAPACITY_BYTES: usize = DATA_RATE;

/// Upper bound on waiting for queued audio to play out
const DRAIN_LIMIT: Duration = Duration::from_secs(10);

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Speaker opened through cpal
pub struct CpalSpeaker {
    queue: SampleQueue,
    device_rate: u32,
    /// Odd trailing byte carried to the next write
    pending_byte: Option<u8>,
    cmd_tx: Option<std::sync::mpsc::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

fn find_output_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if device_name == "default" {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default".to_string()));
    }

    let devices: Vec<cpal::Device> = host
        .output_devices()
        .map_err(|e| AudioError::Connection(e.to_string()))?
        .collect();
    let names: Vec<String> = devices.iter().filter_map(|d| d.name().ok()).collect();

    let matched = match_device_name(&names, device_name)
        .ok_or_else(|| AudioError::DeviceNotFound(device_name.to_string()))?
        .to_string();

    devices
        .into_iter()
        .find(|d| d.name().map(|n| n == matched).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(device_name.to_string()))
}

impl CpalSpeaker {
    /// Open the named output device and start its stream
    pub fn open(device_name: &str) -> Result<Self, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = find_output_device(&host, device_name)?;
        tracing::info!(
            "Using output device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioError::Connection(e.to_string()))?;
        let device_rate = supported_config.sample_rate().0;
        let channels = supported_config.channels() as usize;
        let sample_format = supported_config.sample_format();

        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let stream_queue = queue.clone();

        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), AudioError>>(1);

        let thread_handle = thread::spawn(move || {
            let stream_config = cpal::StreamConfig {
                channels: supported_config.channels(),
                sample_rate: supported_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };
            let err_fn = |err| tracing::error!("Output stream error: {}", err);

            let stream_result = match sample_format {
                cpal::SampleFormat::F32 => {
                    build_stream::<f32>(&device, &stream_config, stream_queue, channels, err_fn)
                }
                cpal::SampleFormat::I16 => {
                    build_stream::<i16>(&device, &stream_config, stream_queue, channels, err_fn)
                }
                cpal::SampleFormat::U16 => {
                    build_stream::<u16>(&device, &stream_config, stream_queue, channels, err_fn)
                }
                format => Err(AudioError::StreamError(format!(
                    "Unsupported sample format: {:?}",
                    format
                ))),
            };

            let stream = match stream_result {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            let _ = cmd_rx.recv();
            drop(stream);
            tracing::debug!("Speaker thread stopped");
        });

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => return Err(AudioError::Timeout(2)),
        }

        Ok(Self {
            queue,
            device_rate,
            pending_byte: None,
            cmd_tx: Some(cmd_tx),
            thread_handle: Some(thread_handle),
        })
    }

    /// Queued audio expressed as session bytes
    fn queued_bytes(&self) -> usize {
        let samples = lock(&self.queue).len() as u64;
        (samples * SAMPLE_RATE as u64 / self.device_rate.max(1) as u64) as usize * 2
    }

    fn is_idle(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    fn stop_thread(&mut self) {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

#[async_trait::async_trait]
impl OutputDevice for CpalSpeaker {
    fn available(&self) -> usize {
        QUEUE_CAPACITY_BYTES.saturating_sub(self.queued_bytes())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<usize, AudioError> {
        if self.cmd_tx.is_none() {
            return Err(AudioError::StreamError("Speaker is closed".to_string()));
        }

        let mut data = Vec::with_capacity(bytes.len() + 1);
        data.extend(self.pending_byte.take());
        data.extend_from_slice(bytes);
        if data.len() % 2 == 1 {
            self.pending_byte = data.pop();
        }

        let samples = resample(&pcm16_to_f32(&data), SAMPLE_RATE, self.device_rate);
        lock(&self.queue).extend(samples);
        Ok(bytes.len())
    }

    async fn flush(&mut self) {
        self.pending_byte = None;
        lock(&self.queue).clear();
    }

    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + DRAIN_LIMIT;
        while !self.is_idle() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Speaker did not finish playing within {:?}", DRAIN_LIMIT);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn close(&mut self) {
        self.stop_thread();
        lock(&self.queue).clear();
        tracing::debug!("Speaker closed");
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Build an output stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: SampleQueue,
    channels: usize,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    use cpal::traits::DeviceTrait;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = lock(&queue);
                for frame in data.chunks_mut(channels.max(1)) {
                    // Underrun plays silence
                    let sample = queue.pop_front().unwrap_or(0.0);
                    let value = T::from_sample(sample);
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}
