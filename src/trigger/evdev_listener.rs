//! evdev hotkey trigger
//!
//! Watches every keyboard under /dev/input for presses of one key. Works
//! without a display server, so it suits headless devices with a USB keypad.
//!
//! The user must be in the 'input' group to open /dev/input/* devices.

use super::{TriggerEvent, TriggerSource};
use crate::error::TriggerError;
use evdev::{Device, InputEventKind, Key};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Key names accepted in `trigger.key` (without the KEY_ prefix)
const KEY_NAMES: &[(&str, Key)] = &[
    ("SCROLLLOCK", Key::KEY_SCROLLLOCK),
    ("PAUSE", Key::KEY_PAUSE),
    ("CAPSLOCK", Key::KEY_CAPSLOCK),
    ("NUMLOCK", Key::KEY_NUMLOCK),
    ("INSERT", Key::KEY_INSERT),
    ("SPACE", Key::KEY_SPACE),
    ("ENTER", Key::KEY_ENTER),
    ("KPENTER", Key::KEY_KPENTER),
    ("ESC", Key::KEY_ESC),
    ("F1", Key::KEY_F1),
    ("F2", Key::KEY_F2),
    ("F3", Key::KEY_F3),
    ("F4", Key::KEY_F4),
    ("F5", Key::KEY_F5),
    ("F6", Key::KEY_F6),
    ("F7", Key::KEY_F7),
    ("F8", Key::KEY_F8),
    ("F9", Key::KEY_F9),
    ("F10", Key::KEY_F10),
    ("F11", Key::KEY_F11),
    ("F12", Key::KEY_F12),
    ("F13", Key::KEY_F13),
    ("F14", Key::KEY_F14),
    ("F15", Key::KEY_F15),
    ("F16", Key::KEY_F16),
    ("F17", Key::KEY_F17),
    ("F18", Key::KEY_F18),
    ("F19", Key::KEY_F19),
    ("F20", Key::KEY_F20),
    ("F21", Key::KEY_F21),
    ("F22", Key::KEY_F22),
    ("F23", Key::KEY_F23),
    ("F24", Key::KEY_F24),
    ("PLAYPAUSE", Key::KEY_PLAYPAUSE),
    ("MICMUTE", Key::KEY_MICMUTE),
];

pub struct EvdevTrigger {
    key: Key,
    device_paths: Vec<PathBuf>,
    cancel: Option<CancellationToken>,
}

impl EvdevTrigger {
    pub fn new(key_name: &str) -> Result<Self, TriggerError> {
        let key = parse_key_name(key_name)?;
        let device_paths = find_keyboard_devices()?;
        if device_paths.is_empty() {
            return Err(TriggerError::NoKeyboard);
        }

        tracing::debug!("Found {} keyboard device(s): {:?}", device_paths.len(), device_paths);

        Ok(Self {
            key,
            device_paths,
            cancel: None,
        })
    }
}

#[async_trait::async_trait]
impl TriggerSource for EvdevTrigger {
    async fn start(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TriggerError> {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.replace(cancel.clone()) {
            previous.cancel();
        }

        let key = self.key;
        let device_paths = self.device_paths.clone();
        tokio::task::spawn_blocking(move || watch_keyboards(device_paths, key, tx, cancel));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), TriggerError> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }
}

fn set_nonblocking(device: &Device) {
    let fd = device.as_raw_fd();
    // SAFETY: fd is a valid descriptor owned by `device` for this call
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags != -1 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Blocking poll loop; one press (value 1) is one trigger, repeats ignored
fn watch_keyboards(
    device_paths: Vec<PathBuf>,
    key: Key,
    tx: mpsc::Sender<TriggerEvent>,
    cancel: CancellationToken,
) {
    let mut devices: Vec<Device> = device_paths
        .iter()
        .filter_map(|path| match Device::open(path) {
            Ok(device) => {
                set_nonblocking(&device);
                Some(device)
            }
            Err(e) => {
                tracing::warn!("Failed to open {:?}: {}", path, e);
                None
            }
        })
        .collect();

    if devices.is_empty() {
        tracing::error!("No keyboard devices could be opened, hotkey trigger stopped");
        return;
    }

    tracing::info!("Press {:?} to talk", key);

    while !cancel.is_cancelled() {
        for device in &mut devices {
            let Ok(events) = device.fetch_events() else {
                continue;
            };
            for event in events {
                let InputEventKind::Key(pressed) = event.kind() else {
                    continue;
                };
                if pressed == key && event.value() == 1 {
                    tracing::debug!("Hotkey pressed");
                    if tx.blocking_send(TriggerEvent::Wake).is_err() {
                        return;
                    }
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    tracing::debug!("Hotkey trigger stopped");
}

/// Keyboards are event devices that report letter keys and Enter
fn find_keyboard_devices() -> Result<Vec<PathBuf>, TriggerError> {
    let input_dir = std::fs::read_dir("/dev/input")
        .map_err(|e| TriggerError::DeviceAccess(format!("/dev/input: {}", e)))?;

    let mut keyboards = Vec::new();
    for entry in input_dir {
        let path = entry
            .map_err(|e| TriggerError::Evdev(e.to_string()))?
            .path();

        let is_event_device = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("event"));
        if !is_event_device {
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                let is_keyboard = device.supported_keys().is_some_and(|keys| {
                    keys.contains(Key::KEY_A)
                        && keys.contains(Key::KEY_Z)
                        && keys.contains(Key::KEY_ENTER)
                });
                if is_keyboard {
                    tracing::debug!(
                        "Found keyboard: {:?} ({})",
                        path,
                        device.name().unwrap_or("unknown")
                    );
                    keyboards.push(path);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(TriggerError::DeviceAccess(path.display().to_string()));
            }
            Err(e) => tracing::trace!("Skipping {:?}: {}", path, e),
        }
    }

    Ok(keyboards)
}

/// Resolve a key name such as "ScrollLock", "f13" or "KEY_PAUSE"
fn parse_key_name(name: &str) -> Result<Key, TriggerError> {
    let normalized: String = name
        .trim()
        .chars()
        .filter(|c| !matches!(c, '-' | ' ' | '_'))
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let bare = normalized.strip_prefix("KEY").unwrap_or(&normalized);

    KEY_NAMES
        .iter()
        .find(|(candidate, _)| *candidate == bare)
        .map(|(_, key)| *key)
        .ok_or_else(|| TriggerError::UnknownKey(name.to_string()))
}
