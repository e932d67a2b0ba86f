//! Configuration loading and types for voxclient
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/voxclient/config.toml)
//! 3. Environment variables (VOXCLIENT_*)
//! 4. CLI arguments (highest priority)

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# voxclient configuration
#
# Location: ~/.config/voxclient/config.toml
# host, skillset and api_key are required. They may also be provided via
# VOXCLIENT_HOST, VOXCLIENT_SKILLSET and VOXCLIENT_API_KEY.

[server]
# Session server host name (no scheme)
host = "assistant.example.com"

# Port (omit to use the scheme default)
# port = 443

# Use wss:// (true) or ws:// (false)
tls = true

# API key exchanged for a bearer token before every connect
api_key = ""

# Token endpoint
# token_url = "https://iam.bluemix.net/oidc/token"

# Routing parameters sent with the connect request
skillset = "default"
# tenant_id = ""
# user_id = "voxclient"
# language = "en-US"
# engine = "watson"

# Synthesis voice
# voice = "en-US_LisaVoice"

# Ask the server for a URL to synthesized audio instead of streaming it
# url_tts = false

# Never play server audio
# mute = false

# Text the server speaks once the session is ready
# greeting = "Ready"

[control]
# Local line-protocol control socket (for an external controller or test harness)
# bind_address = "127.0.0.1"
# command_port = 10010

# Local raw PCM relay socket (stands in for microphone/speaker)
# audio_port = 10011

[audio]
# Audio input and output devices ("default" uses system default)
# List devices with: pactl list sources short
input_device = "default"
output_device = "default"

# [audio.feedback]
# Local prompt sounds (authentication, network and configuration errors)
# enabled = true
#
# Sound theme: "default", "subtle", or path to a directory of <prompt>.wav files
# theme = "default"
#
# Volume level (0.0 to 1.0)
# volume = 0.7

[trigger]
# Wake trigger: "key" (Enter on stdin), "hotkey" (evdev key), "gpio", or "none"
kind = "key"

# Key for the "hotkey" trigger (evdev KEY_* name without the prefix)
# key = "SCROLLLOCK"

# Value file for the "gpio" trigger
# gpio_value_path = "/sys/class/gpio/gpio4/value"
# debounce_ms = 50

[indicator]
# Status indicator: "console" (log only) or "led" (sysfs brightness file)
# kind = "console"
# led_path = "/sys/class/leds/led0/brightness"

[logging]
# Log per-turn timing and byte counts
# log_audio_info = false
"#;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub indicator: IndicatorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session server connection parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host name of the session server
    #[serde(default)]
    pub host: String,

    /// Port, or None for the scheme default
    #[serde(default)]
    pub port: Option<u16>,

    /// Connect with wss:// instead of ws://
    #[serde(default = "default_true")]
    pub tls: bool,

    /// API key exchanged for a bearer token
    #[serde(default)]
    pub api_key: String,

    /// Token endpoint URL
    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default)]
    pub skillset: String,

    #[serde(default)]
    pub tenant_id: String,

    #[serde(default = "default_user_id")]
    pub user_id: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_engine")]
    pub engine: String,

    /// Synthesis voice sent with tts_options
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Request synthesized audio by URL instead of streamed frames
    #[serde(default)]
    pub url_tts: bool,

    /// Drop all server audio
    #[serde(default)]
    pub mute: bool,

    /// Spoken once each time the session becomes ready
    #[serde(default)]
    pub greeting: Option<String>,
}

/// Local listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_command_port")]
    pub command_port: u16,

    #[serde(default = "default_audio_port")]
    pub audio_port: u16,
}

/// Audio device configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Input device name, or "default"
    #[serde(default = "default_device")]
    pub input_device: String,

    /// Output device name, or "default"
    #[serde(default = "default_device")]
    pub output_device: String,

    /// Local prompt sound settings
    #[serde(default)]
    pub feedback: AudioFeedbackConfig,
}

/// Local prompt sound configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioFeedbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sound theme: "default", "subtle", or path to custom theme directory
    #[serde(default = "default_sound_theme")]
    pub theme: String,

    /// Volume level (0.0 to 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,
}

/// Wake trigger selection
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Enter key on stdin
    #[default]
    Key,
    /// evdev key press (Linux)
    Hotkey,
    /// sysfs GPIO button
    Gpio,
    /// Only the control channel starts captures
    None,
}

impl TriggerKind {
    /// Parse a trigger name as written in the config file
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "key" => Some(Self::Key),
            "hotkey" => Some(Self::Hotkey),
            "gpio" => Some(Self::Gpio),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Wake trigger configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub kind: TriggerKind,

    /// Key name for the hotkey trigger (evdev KEY_* constant name, without the prefix)
    #[serde(default = "default_hotkey_key")]
    pub key: String,

    /// sysfs value file polled by the gpio trigger
    #[serde(default = "default_gpio_value_path")]
    pub gpio_value_path: PathBuf,

    /// Minimum time the GPIO line must stay high before it counts as a press
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Status indicator selection
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    #[default]
    Console,
    Led,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndicatorConfig {
    #[serde(default)]
    pub kind: IndicatorKind,

    #[serde(default = "default_led_path")]
    pub led_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log per-turn timings and write counters
    #[serde(default)]
    pub log_audio_info: bool,
}

fn default_true() -> bool {
    true
}

fn default_token_url() -> String {
    "https://iam.bluemix.net/oidc/token".to_string()
}

fn default_user_id() -> String {
    "voxclient".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_engine() -> String {
    "watson".to_string()
}

fn default_voice() -> String {
    "en-US_LisaVoice".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_command_port() -> u16 {
    10010
}

fn default_audio_port() -> u16 {
    10011
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sound_theme() -> String {
    "default".to_string()
}

fn default_volume() -> f32 {
    0.7
}

fn default_hotkey_key() -> String {
    "SCROLLLOCK".to_string()
}

fn default_gpio_value_path() -> PathBuf {
    PathBuf::from("/sys/class/gpio/gpio4/value")
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_led_path() -> PathBuf {
    PathBuf::from("/sys/class/leds/led0/brightness")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            tls: true,
            api_key: String::new(),
            token_url: default_token_url(),
            skillset: String::new(),
            tenant_id: String::new(),
            user_id: default_user_id(),
            language: default_language(),
            engine: default_engine(),
            voice: default_voice(),
            url_tts: false,
            mute: false,
            greeting: None,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            command_port: default_command_port(),
            audio_port: default_audio_port(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: default_device(),
            output_device: default_device(),
            feedback: AudioFeedbackConfig::default(),
        }
    }
}

impl Default for AudioFeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            theme: default_sound_theme(),
            volume: default_volume(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            kind: TriggerKind::default(),
            key: default_hotkey_key(),
            gpio_value_path: default_gpio_value_path(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            kind: IndicatorKind::default(),
            led_path: default_led_path(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voxclient")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check that every required field is present
    pub fn validate(&self) -> Result<(), ClientError> {
        let required = [
            ("server.host", &self.server.host),
            ("server.skillset", &self.server.skillset),
            ("server.api_key", &self.server.api_key),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(ClientError::Config(format!(
                "Missing required setting(s): {}",
                missing.join(", ")
            )));
        }

        if let Err(e) = crate::session::session_url(&self.server) {
            return Err(ClientError::Config(format!(
                "server.host '{}' does not form a valid session URL: {}",
                self.server.host, e
            )));
        }

        if self.control.command_port == self.control.audio_port {
            return Err(ClientError::Config(format!(
                "control.command_port and control.audio_port must differ (both {})",
                self.control.command_port
            )));
        }

        Ok(())
    }

    /// Copy of the configuration safe for printing
    pub fn redacted(&self) -> Config {
        let mut config = self.clone();
        if !config.server.api_key.is_empty() {
            config.server.api_key = "********".to_string();
        }
        config
    }
}

/// Load configuration from file, with defaults for missing values
///
/// An explicitly requested file that does not exist is an error; a missing
/// file at the default location falls back to defaults plus environment.
pub fn load_config(path: Option<&Path>) -> Result<Config, ClientError> {
    let mut config = Config::default();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ClientError::ConfigNotFound(path.to_path_buf()));
        }
    }

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ClientError::Config(format!("Failed to read config: {}", e)))?;

            config = parse_config(&contents)?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Parse a TOML document into a configuration
pub fn parse_config(contents: &str) -> Result<Config, ClientError> {
    toml::from_str(contents).map_err(|e| ClientError::Config(format!("Invalid config: {}", e)))
}

/// Apply VOXCLIENT_* overrides using the given variable lookup
fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("VOXCLIENT_HOST") {
        config.server.host = host;
    }
    if let Some(key) = var("VOXCLIENT_API_KEY") {
        config.server.api_key = key;
    }
    if let Some(skillset) = var("VOXCLIENT_SKILLSET") {
        config.server.skillset = skillset;
    }
    if let Some(tenant) = var("VOXCLIENT_TENANT_ID") {
        config.server.tenant_id = tenant;
    }
    if let Some(kind) = var("VOXCLIENT_TRIGGER") {
        match TriggerKind::from_name(&kind) {
            Some(kind) => config.trigger.kind = kind,
            None => tracing::warn!("Ignoring unknown VOXCLIENT_TRIGGER '{}'", kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.server.tls);
        assert_eq!(config.server.voice, "en-US_LisaVoice");
        assert_eq!(config.control.command_port, 10010);
        assert_eq!(config.control.audio_port, 10011);
        assert_eq!(config.trigger.kind, TriggerKind::Key);
        assert_eq!(config.indicator.kind, IndicatorKind::Console);
        assert!(!config.logging.log_audio_info);
    }

    #[test]
    fn test_default_config_fails_validation() {
        let err = Config::default().validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("server.host"));
        assert!(message.contains("server.skillset"));
        assert!(message.contains("server.api_key"));
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
            [server]
            host = "assistant.local"
            port = 8443
            api_key = "secret"
            skillset = "kitchen"
            tenant_id = "acme"
            url_tts = true

            [control]
            command_port = 20010
            audio_port = 20011

            [trigger]
            kind = "gpio"
            gpio_value_path = "/tmp/gpio/value"
            debounce_ms = 20

            [indicator]
            kind = "led"
        "#;

        let config = parse_config(toml_str).unwrap();
        assert_eq!(config.server.host, "assistant.local");
        assert_eq!(config.server.port, Some(8443));
        assert!(config.server.tls); // default
        assert!(config.server.url_tts);
        assert_eq!(config.server.engine, "watson"); // default
        assert_eq!(config.control.command_port, 20010);
        assert_eq!(config.trigger.kind, TriggerKind::Gpio);
        assert_eq!(config.trigger.gpio_value_path, PathBuf::from("/tmp/gpio/value"));
        assert_eq!(config.trigger.debounce_ms, 20);
        assert_eq!(config.indicator.kind, IndicatorKind::Led);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_template_parses() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.server.host, "assistant.example.com");
        assert_eq!(config.audio.input_device, "default");
    }

    #[test]
    fn test_same_ports_rejected() {
        let toml_str = r#"
            [server]
            host = "h"
            api_key = "k"
            skillset = "s"

            [control]
            command_port = 9000
            audio_port = 9000
        "#;
        let config = parse_config(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_host_must_form_session_url() {
        let toml_str = r#"
            [server]
            host = "assistant local"
            api_key = "k"
            skillset = "s"
        "#;
        let config = parse_config(toml_str).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.host"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VOXCLIENT_HOST", "env-host"),
            ("VOXCLIENT_API_KEY", "env-key"),
            ("VOXCLIENT_SKILLSET", "env-skills"),
            ("VOXCLIENT_TRIGGER", "none"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.host, "env-host");
        assert_eq!(config.server.api_key, "env-key");
        assert_eq!(config.server.skillset, "env-skills");
        assert_eq!(config.trigger.kind, TriggerKind::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redacted_masks_api_key() {
        let mut config = Config::default();
        config.server.api_key = "top-secret".to_string();
        let shown = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!shown.contains("top-secret"));
        assert_eq!(config.server.api_key, "top-secret");
    }

    #[test]
    fn test_missing_explicit_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, ClientError::ConfigNotFound(_)));
    }

    #[test]
    fn test_trigger_kind_from_name() {
        assert_eq!(TriggerKind::from_name("GPIO"), Some(TriggerKind::Gpio));
        assert_eq!(TriggerKind::from_name(" hotkey "), Some(TriggerKind::Hotkey));
        assert_eq!(TriggerKind::from_name("none"), Some(TriggerKind::None));
        assert_eq!(TriggerKind::from_name("pedal"), None);
    }
}
