//! Audio device module
//!
//! Microphone and speaker access using cpal, which works with PipeWire,
//! PulseAudio, and ALSA backends, plus the local prompt player (rodio).
//! The audio relay socket can stand in for either device.
//!
//! All PCM exchanged with the session is mono, 16-bit little-endian, 16 kHz.

pub mod cpal_capture;
pub mod cpal_playback;
pub mod feedback;

use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::relay::{AudioRelay, RelayInput, RelayOutput};
use std::time::Duration;

/// Session sample rate in Hz
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes per sample frame written to a sink (two 16-bit samples)
pub const FRAME_SIZE: usize = 4;

/// Bytes per second of session PCM (16 kHz × 2 bytes)
pub const DATA_RATE: usize = 32_000;

/// Where captured audio comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSource {
    #[default]
    Microphone,
    Relay,
}

/// Where synthesized audio goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputTarget {
    #[default]
    Speaker,
    Relay,
}

impl std::fmt::Display for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSource::Microphone => write!(f, "microphone"),
            InputSource::Relay => write!(f, "audio relay"),
        }
    }
}

impl std::fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputTarget::Speaker => write!(f, "speaker"),
            OutputTarget::Relay => write!(f, "audio relay"),
        }
    }
}

/// An open capture device producing session PCM
#[async_trait::async_trait]
pub trait InputDevice: Send {
    /// Size of one read buffer in bytes
    fn buffer_size(&self) -> usize;

    /// Bytes produced per second
    fn data_rate(&self) -> usize;

    /// Read up to `buf.len()` bytes, returning 0 if nothing arrived within `timeout`
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, AudioError>;

    /// Discard anything buffered but not yet read
    async fn drain(&mut self);

    /// Release the device
    async fn release(&mut self);
}

/// An open playback device consuming session PCM
#[async_trait::async_trait]
pub trait OutputDevice: Send {
    /// Bytes the device accepts right now without blocking
    fn available(&self) -> usize;

    /// Write bytes, returning how many were accepted
    async fn write(&mut self, bytes: &[u8]) -> Result<usize, AudioError>;

    /// Discard audio written but not yet played
    async fn flush(&mut self);

    /// Wait until audio written so far has played
    async fn drain(&mut self);

    /// Close the device
    async fn close(&mut self);
}

/// Opens capture and playback devices
pub trait AudioDevices: Send + Sync {
    fn open_input(&self, source: InputSource) -> Result<Box<dyn InputDevice>, AudioError>;
    fn open_output(&self, target: OutputTarget) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Local cpal devices plus the audio relay
pub struct SystemAudio {
    config: AudioConfig,
    relay: AudioRelay,
}

impl SystemAudio {
    pub fn new(config: &AudioConfig, relay: AudioRelay) -> Self {
        Self {
            config: config.clone(),
            relay,
        }
    }
}

impl AudioDevices for SystemAudio {
    fn open_input(&self, source: InputSource) -> Result<Box<dyn InputDevice>, AudioError> {
        match source {
            InputSource::Microphone => Ok(Box::new(cpal_capture::CpalMicrophone::open(
                &self.config.input_device,
            )?)),
            InputSource::Relay => Ok(Box::new(RelayInput::open(self.relay.clone())?)),
        }
    }

    fn open_output(&self, target: OutputTarget) -> Result<Box<dyn OutputDevice>, AudioError> {
        match target {
            OutputTarget::Speaker => Ok(Box::new(cpal_playback::CpalSpeaker::open(
                &self.config.output_device,
            )?)),
            OutputTarget::Relay => Ok(Box::new(RelayOutput::new(self.relay.clone()))),
        }
    }
}

/// Round a byte count down to a whole number of frames
pub fn frame_align(len: usize) -> usize {
    len - (len % FRAME_SIZE)
}

/// Find an audio device by name with flexible matching.
///
/// Matching strategy (in order):
/// 1. Exact match (case-sensitive)
/// 2. Exact match (case-insensitive)
/// 3. Substring match: device name contains the search term (case-insensitive)
pub(crate) fn match_device_name<'a>(names: &'a [String], wanted: &str) -> Option<&'a str> {
    let wanted_lower = wanted.to_lowercase();

    names
        .iter()
        .find(|n| n.as_str() == wanted)
        .or_else(|| names.iter().find(|n| n.to_lowercase() == wanted_lower))
        .or_else(|| names.iter().find(|n| n.to_lowercase().contains(&wanted_lower)))
        .map(String::as_str)
}

/// Linear interpolation resampling
pub(crate) fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };

        output.push(sample);
    }

    output
}

/// Convert f32 samples to 16-bit little-endian PCM bytes
pub(crate) fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| {
            let clamped = s.clamp(-1.0, 1.0);
            ((clamped * i16::MAX as f32) as i16).to_le_bytes()
        })
        .collect()
}

/// Convert 16-bit little-endian PCM bytes to f32 samples (a trailing odd byte is ignored)
pub(crate) fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_align() {
        assert_eq!(frame_align(0), 0);
        assert_eq!(frame_align(3), 0);
        assert_eq!(frame_align(4), 4);
        assert_eq!(frame_align(1027), 1024);
    }

    #[test]
    fn test_match_device_name_order() {
        let names = vec![
            "alsa_input.pci-0000_00_1f.3.analog-stereo".to_string(),
            "USB Mic".to_string(),
            "usb mic monitor".to_string(),
        ];
        assert_eq!(match_device_name(&names, "USB Mic"), Some("USB Mic"));
        assert_eq!(match_device_name(&names, "usb mic"), Some("USB Mic"));
        assert_eq!(
            match_device_name(&names, "analog-stereo"),
            Some("alsa_input.pci-0000_00_1f.3.analog-stereo")
        );
        assert_eq!(match_device_name(&names, "bluetooth"), None);
    }

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_downsample() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let result = resample(&samples, 48000, 16000);
        // 48000 -> 16000 is 3:1 ratio, so 8 samples -> ~3 samples
        assert!(result.len() >= 2 && result.len() <= 4);
    }

    #[test]
    fn test_resample_upsample() {
        let samples = vec![1.0, 2.0];
        assert_eq!(resample(&samples, 8000, 16000).len(), 4);
    }

    #[test]
    fn test_pcm16_conversion() {
        let bytes = f32_to_pcm16(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &[0, 0]);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MAX);

        let back = pcm16_to_f32(&bytes[..5]);
        assert_eq!(back.len(), 2);
        assert!((back[1] - 1.0).abs() < 1e-6);
    }
}
