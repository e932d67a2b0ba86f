//! Wake trigger sources
//!
//! A trigger source turns some physical or console event into a
//! [`TriggerEvent`]. The daemon forwards each event to the session, which
//! decides whether a capture may start.
//!
//! - `key`: Enter on stdin
//! - `hotkey`: a key press on any keyboard via evdev (Linux, 'input' group)
//! - `gpio`: a button wired to a sysfs GPIO value file

pub mod gpio;
pub mod key;

#[cfg(target_os = "linux")]
pub mod evdev_listener;

use crate::config::{TriggerConfig, TriggerKind};
use crate::error::TriggerError;
use std::time::Duration;
use tokio::sync::mpsc;

/// Events emitted by a trigger source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    /// The user asked to talk
    Wake,
}

/// A source of wake triggers
#[async_trait::async_trait]
pub trait TriggerSource: Send + Sync {
    /// Start watching; events arrive on the returned channel
    async fn start(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TriggerError>;

    /// Stop watching and close the channel
    async fn stop(&mut self) -> Result<(), TriggerError>;
}

/// Build the trigger source selected by the configuration
///
/// Returns `None` for `kind = "none"`, where only the control channel starts
/// captures.
pub fn create_trigger(config: &TriggerConfig) -> Result<Option<Box<dyn TriggerSource>>, TriggerError> {
    match config.kind {
        TriggerKind::None => Ok(None),
        TriggerKind::Key => Ok(Some(Box::new(key::KeyTrigger::stdin()))),
        TriggerKind::Gpio => Ok(Some(Box::new(gpio::GpioTrigger::new(
            &config.gpio_value_path,
            Duration::from_millis(config.debounce_ms),
        )?))),
        TriggerKind::Hotkey => create_hotkey(config),
    }
}

#[cfg(target_os = "linux")]
fn create_hotkey(config: &TriggerConfig) -> Result<Option<Box<dyn TriggerSource>>, TriggerError> {
    Ok(Some(Box::new(evdev_listener::EvdevTrigger::new(&config.key)?)))
}

#[cfg(not(target_os = "linux"))]
fn create_hotkey(_config: &TriggerConfig) -> Result<Option<Box<dyn TriggerSource>>, TriggerError> {
    Err(TriggerError::NotSupported("hotkey".to_string()))
}
