//! Local prompt sounds
//!
//! Short cues played on the device itself when the session cannot speak for
//! us: authentication failures, network trouble, bad configuration, and
//! shutdown. Supports generated themes and directories of custom sound files.

use crate::config::AudioFeedbackConfig;
use crate::error::AudioError;
use hound::{SampleFormat, WavSpec, WavWriter};
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Prompts the client can play locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSound {
    /// Token endpoint rejected the API key
    ErrorAuth,
    /// Configuration is present but invalid
    ErrorConfig,
    /// No configuration file was found
    ErrorNoConfigFile,
    /// Token endpoint or session server unreachable
    ErrorNetwork,
    /// Client is shutting down
    Aborting,
}

impl PromptSound {
    /// File stem used for custom theme directories
    pub fn file_name(&self) -> &'static str {
        match self {
            PromptSound::ErrorAuth => "error-auth",
            PromptSound::ErrorConfig => "error-config",
            PromptSound::ErrorNoConfigFile => "error-no-config-file",
            PromptSound::ErrorNetwork => "error-network",
            PromptSound::Aborting => "aborting",
        }
    }
}

/// Something that can play prompt sounds
pub trait PromptPlayer: Send + Sync {
    /// Queue a prompt; returns immediately
    fn play(&self, sound: PromptSound);
}

/// Player used when prompts are disabled or no output is available
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentPrompts;

impl PromptPlayer for SilentPrompts {
    fn play(&self, sound: PromptSound) {
        tracing::debug!("Prompt '{}' (silent)", sound.file_name());
    }
}

struct PlayRequest {
    sound: PromptSound,
    done: Option<mpsc::SyncSender<()>>,
}

/// Prompt player backed by rodio
///
/// rodio's OutputStream is not Send, so playback runs on its own thread and
/// prompts are queued to it.
pub struct AudioFeedback {
    tx: mpsc::Sender<PlayRequest>,
}

/// Audio data for each prompt
struct SoundTheme {
    error_auth: Vec<u8>,
    error_config: Vec<u8>,
    error_no_config_file: Vec<u8>,
    error_network: Vec<u8>,
    aborting: Vec<u8>,
}

impl SoundTheme {
    fn sound(&self, sound: PromptSound) -> &[u8] {
        match sound {
            PromptSound::ErrorAuth => &self.error_auth,
            PromptSound::ErrorConfig => &self.error_config,
            PromptSound::ErrorNoConfigFile => &self.error_no_config_file,
            PromptSound::ErrorNetwork => &self.error_network,
            PromptSound::Aborting => &self.aborting,
        }
    }
}

impl AudioFeedback {
    /// Open the default output and load the configured theme
    pub fn new(config: &AudioFeedbackConfig) -> Result<Self, AudioError> {
        let theme = load_theme(&config.theme)?;
        let volume = config.volume.clamp(0.0, 1.0);

        let (tx, rx) = mpsc::channel::<PlayRequest>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);

        thread::Builder::new()
            .name("prompt-player".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::Connection(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                for request in rx {
                    let data = theme.sound(request.sound);
                    if data.is_empty() {
                        continue;
                    }
                    let played = Decoder::new(Cursor::new(data.to_vec()))
                        .map_err(|e| e.to_string())
                        .and_then(|source| {
                            let sink = Sink::try_new(&handle).map_err(|e| e.to_string())?;
                            sink.append(source.amplify(volume));
                            sink.sleep_until_end();
                            Ok(())
                        });
                    if let Err(e) = played {
                        tracing::warn!("Failed to play prompt '{}': {}", request.sound.file_name(), e);
                    }
                    if let Some(done) = request.done {
                        let _ = done.send(());
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => Ok(Self { tx }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::Timeout(2)),
        }
    }

    /// Play a prompt and wait for it to finish, at most `max`
    pub fn play_blocking(&self, sound: PromptSound, max: Duration) {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        let request = PlayRequest {
            sound,
            done: Some(done_tx),
        };
        if self.tx.send(request).is_ok() {
            let _ = done_rx.recv_timeout(max);
        }
    }
}

impl PromptPlayer for AudioFeedback {
    fn play(&self, sound: PromptSound) {
        tracing::debug!("Playing prompt '{}'", sound.file_name());
        let _ = self.tx.send(PlayRequest { sound, done: None });
    }
}

/// Build the prompt player for `config`, falling back to silence
pub fn create_prompt_player(config: &AudioFeedbackConfig) -> Arc<dyn PromptPlayer> {
    if !config.enabled {
        return Arc::new(SilentPrompts);
    }
    match AudioFeedback::new(config) {
        Ok(player) => Arc::new(player),
        Err(e) => {
            tracing::warn!("Prompt sounds unavailable: {}", e);
            Arc::new(SilentPrompts)
        }
    }
}

/// Load a sound theme by name or directory path
fn load_theme(theme_name: &str) -> Result<SoundTheme, AudioError> {
    match theme_name {
        "default" => generate_default_theme(),
        "subtle" => generate_subtle_theme(),
        path => load_custom_theme(path),
    }
}

/// Load `<prompt>.wav` files from a directory; missing files play nothing
fn load_custom_theme(path: &str) -> Result<SoundTheme, AudioError> {
    let dir = PathBuf::from(path);
    if !dir.is_dir() {
        return Err(AudioError::SourceNotAvailable(format!(
            "Theme directory not found: {}",
            path
        )));
    }

    let load = |sound: PromptSound| -> Vec<u8> {
        std::fs::read(dir.join(format!("{}.wav", sound.file_name()))).unwrap_or_default()
    };

    Ok(SoundTheme {
        error_auth: load(PromptSound::ErrorAuth),
        error_config: load(PromptSound::ErrorConfig),
        error_no_config_file: load(PromptSound::ErrorNoConfigFile),
        error_network: load(PromptSound::ErrorNetwork),
        aborting: load(PromptSound::Aborting),
    })
}

// Sounds are generated at startup so no binary assets ship with the client

const TONE_RATE: u32 = 44_100;

/// A sequence of (frequency Hz, duration ms) segments with fades at each end
fn generate_tones(segments: &[(f32, u32)], fade_ms: u32, level: f32) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: TONE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let fade = (TONE_RATE * fade_ms / 1000) as usize;
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
        for &(frequency, duration_ms) in segments {
            let count = (TONE_RATE * duration_ms / 1000) as usize;
            for i in 0..count {
                let t = i as f32 / TONE_RATE as f32;
                let mut amplitude = (2.0 * std::f32::consts::PI * frequency * t).sin();
                if fade > 0 && i < fade {
                    amplitude *= i as f32 / fade as f32;
                } else if fade > 0 && i + fade >= count {
                    amplitude *= (count - i) as f32 / fade as f32;
                }
                writer
                    .write_sample((amplitude * level) as i16)
                    .map_err(wav_error)?;
            }
        }
        writer.finalize().map_err(wav_error)?;
    }
    Ok(cursor.into_inner())
}

fn wav_error(e: hound::Error) -> AudioError {
    AudioError::StreamError(format!("Failed to generate prompt: {}", e))
}

/// Default theme: distinct low patterns per failure
fn generate_default_theme() -> Result<SoundTheme, AudioError> {
    Ok(SoundTheme {
        error_auth: generate_tones(&[(440.0, 150), (330.0, 150), (220.0, 250)], 15, 16000.0)?,
        error_config: generate_tones(&[(300.0, 150), (0.0, 80), (300.0, 150)], 15, 16000.0)?,
        error_no_config_file: generate_tones(&[(300.0, 400)], 30, 16000.0)?,
        error_network: generate_tones(&[(660.0, 120), (0.0, 80), (440.0, 120), (0.0, 80), (220.0, 200)], 15, 16000.0)?,
        aborting: generate_tones(&[(880.0, 150), (440.0, 150)], 20, 16000.0)?,
    })
}

/// Subtle theme: short quiet clicks
fn generate_subtle_theme() -> Result<SoundTheme, AudioError> {
    Ok(SoundTheme {
        error_auth: generate_tones(&[(400.0, 60), (300.0, 60)], 10, 9000.0)?,
        error_config: generate_tones(&[(350.0, 50), (0.0, 40), (350.0, 50)], 8, 9000.0)?,
        error_no_config_file: generate_tones(&[(350.0, 120)], 10, 9000.0)?,
        error_network: generate_tones(&[(500.0, 50), (0.0, 40), (300.0, 50)], 8, 9000.0)?,
        aborting: generate_tones(&[(800.0, 50)], 10, 9000.0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_tones_is_wav() {
        let wav = generate_tones(&[(440.0, 100)], 10, 16000.0).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, TONE_RATE);
        assert_eq!(reader.len(), TONE_RATE / 10);
    }

    #[test]
    fn test_generate_themes() {
        for theme in [generate_default_theme().unwrap(), generate_subtle_theme().unwrap()] {
            for sound in [
                PromptSound::ErrorAuth,
                PromptSound::ErrorConfig,
                PromptSound::ErrorNoConfigFile,
                PromptSound::ErrorNetwork,
                PromptSound::Aborting,
            ] {
                assert!(!theme.sound(sound).is_empty(), "{:?}", sound);
            }
        }
    }

    #[test]
    fn test_custom_theme_missing_files_are_silent() {
        let dir = tempfile::tempdir().unwrap();
        let wav = generate_tones(&[(440.0, 50)], 5, 16000.0).unwrap();
        std::fs::write(dir.path().join("error-network.wav"), &wav).unwrap();

        let theme = load_custom_theme(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(theme.sound(PromptSound::ErrorNetwork), wav.as_slice());
        assert!(theme.sound(PromptSound::ErrorAuth).is_empty());
    }

    #[test]
    fn test_custom_theme_requires_directory() {
        assert!(load_custom_theme("/nonexistent/voxclient-theme").is_err());
    }

    #[test]
    fn test_silent_player_accepts_everything() {
        let player = SilentPrompts;
        player.play(PromptSound::Aborting);
    }
}
