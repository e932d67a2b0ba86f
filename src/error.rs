//! Error types for voxclient
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use thiserror::Error;

/// Top-level error type for the voxclient application
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {}\n  Run 'voxclient config --default' for a template.", .0.display())]
    ConfigNotFound(std::path::PathBuf),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while acquiring a bearer token
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Authentication rejected by token endpoint (HTTP {status}). Check the configured api_key.")]
    Authentication { status: u16 },

    #[error("Could not reach token endpoint: {0}")]
    Connection(String),
}

/// Errors related to audio devices
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio connection failed: {0}")]
    Connection(String),

    #[error("Audio device not found: '{0}'. List devices with: pactl list sources short")]
    DeviceNotFound(String),

    #[error("Audio source not available: {0}")]
    SourceNotAvailable(String),

    #[error("Audio device timeout: exceeded {0} seconds")]
    Timeout(u32),

    #[error("Audio stream error: {0}")]
    StreamError(String),
}

/// Errors decoding messages from the session server
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Field '{field}' has unexpected type, expected {expected}")]
    UnexpectedType {
        field: &'static str,
        expected: &'static str,
    },
}

/// Errors related to trigger sources
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Cannot open input device '{0}'. Is the user in the 'input' group?\n  Run: sudo usermod -aG input $USER\n  Then log out and back in.")]
    DeviceAccess(String),

    #[error("Unknown key name: '{0}'. Use evtest or wev to find valid key names.")]
    UnknownKey(String),

    #[error("No keyboard device found in /dev/input/")]
    NoKeyboard,

    #[error("GPIO error: {0}")]
    Gpio(String),

    #[error("Trigger '{0}' is not supported on this platform")]
    NotSupported(String),

    #[error("evdev error: {0}")]
    Evdev(String),
}

/// Errors on the local relay sockets
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No client is connected to the relay")]
    NotConnected,

    #[error("Relay socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ClientError
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_error_converts_to_client_error() {
        let err: ClientError = TokenError::Authentication { status: 400 }.into();
        assert!(matches!(
            err,
            ClientError::Token(TokenError::Authentication { status: 400 })
        ));
        assert!(err.to_string().contains("HTTP 400"));
    }

    #[test]
    fn test_protocol_error_messages() {
        let err = ProtocolError::UnexpectedType {
            field: "prompt",
            expected: "boolean or object",
        };
        assert_eq!(
            err.to_string(),
            "Field 'prompt' has unexpected type, expected boolean or object"
        );
    }
}
