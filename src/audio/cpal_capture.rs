//! cpal-based microphone capture
//!
//! Note: cpal::Stream is not Send, so the stream lives on a dedicated thread
//! and hands converted PCM chunks to the async side over a channel.

use super::{f32_to_pcm16, match_device_name, resample, InputDevice, DATA_RATE, SAMPLE_RATE};
use crate::error::AudioError;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

/// One tenth of a second of session PCM
const READ_BUFFER_SIZE: usize = 3_200;

/// Chunks buffered between the stream callback and the reader
const CHUNK_QUEUE: usize = 64;

/// Commands sent to the capture thread
enum CaptureCommand {
    Stop,
}

/// Parameters for building an audio input stream
struct StreamBuildParams {
    tx: mpsc::Sender<Vec<u8>>,
    source_rate: u32,
    source_channels: usize,
}

/// Microphone opened through cpal
pub struct CpalMicrophone {
    chunks: mpsc::Receiver<Vec<u8>>,
    /// Bytes from the last chunk that did not fit the caller's buffer
    leftover: Vec<u8>,
    cmd_tx: Option<std::sync::mpsc::Sender<CaptureCommand>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

/// Find an input device by configured name ("default" uses the host default)
fn find_input_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if device_name == "default" {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("default".to_string()));
    }

    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| AudioError::Connection(e.to_string()))?
        .collect();
    let names: Vec<String> = devices.iter().filter_map(|d| d.name().ok()).collect();

    let matched = match_device_name(&names, device_name)
        .ok_or_else(|| AudioError::DeviceNotFound(device_name.to_string()))?
        .to_string();
    tracing::debug!("Matched input device '{}' for '{}'", matched, device_name);

    devices
        .into_iter()
        .find(|d| d.name().map(|n| n == matched).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(device_name.to_string()))
}

impl CpalMicrophone {
    /// Open the named input device and start streaming
    pub fn open(device_name: &str) -> Result<Self, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = find_input_device(&host, device_name)?;
        tracing::info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let supported_config = device
            .default_input_config()
            .map_err(|e| AudioError::Connection(e.to_string()))?;
        let source_rate = supported_config.sample_rate().0;
        let source_channels = supported_config.channels() as usize;
        let sample_format = supported_config.sample_format();

        tracing::debug!(
            "Input config: {} Hz, {} channel(s), format: {:?}",
            source_rate,
            source_channels,
            sample_format
        );

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<CaptureCommand>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), AudioError>>(1);

        let thread_handle = thread::spawn(move || {
            let stream_config = cpal::StreamConfig {
                channels: supported_config.channels(),
                sample_rate: supported_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };

            let err_fn = |err| tracing::error!("Input stream error: {}", err);
            let params = StreamBuildParams {
                tx: chunk_tx,
                source_rate,
                source_channels,
            };

            let stream_result = match sample_format {
                cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, params, err_fn),
                cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, params, err_fn),
                cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, params, err_fn),
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

            tracing::debug!("Microphone thread started");

            // Runs until Stop arrives or the handle is dropped
            let _ = cmd_rx.recv();
            drop(stream);

            tracing::debug!("Microphone thread stopped");
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
            chunks: chunk_rx,
            leftover: Vec::new(),
            cmd_tx: Some(cmd_tx),
            thread_handle: Some(thread_handle),
        })
    }

    fn take_leftover(&mut self, buf: &mut [u8]) -> usize {
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        n
    }

    fn stop_thread(&mut self) {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(CaptureCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

#[async_trait::async_trait]
impl InputDevice for CpalMicrophone {
    fn buffer_size(&self) -> usize {
        READ_BUFFER_SIZE
    }

    fn data_rate(&self) -> usize {
        DATA_RATE
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, AudioError> {
        if !self.leftover.is_empty() {
            return Ok(self.take_leftover(buf));
        }

        match tokio::time::timeout(timeout, self.chunks.recv()).await {
            Ok(Some(chunk)) => {
                self.leftover = chunk;
                Ok(self.take_leftover(buf))
            }
            Ok(None) => Err(AudioError::StreamError(
                "Microphone stream ended".to_string(),
            )),
            Err(_) => Ok(0),
        }
    }

    async fn drain(&mut self) {
        self.leftover.clear();
        while self.chunks.try_recv().is_ok() {}
    }

    async fn release(&mut self) {
        self.chunks.close();
        self.stop_thread();
        tracing::debug!("Microphone released");
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Build an input stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: StreamBuildParams,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let StreamBuildParams {
        tx,
        source_rate,
        source_channels,
    } = params;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(source_channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / source_channels as f32
                    })
                    .collect();

                let resampled = resample(&mono, source_rate, SAMPLE_RATE);

                // Receiver may be gone or full; drop the chunk
                let _ = tx.try_send(f32_to_pcm16(&resampled));
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}
