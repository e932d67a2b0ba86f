//! Status indicator
//!
//! A single light (or its log stand-in) that shows what the client is doing:
//! steady on while listening, blinking at a state-specific rate while the
//! server link is not ready.

use crate::config::{IndicatorConfig, IndicatorKind};
use crate::sync::lock;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Something that can show a steady or blinking light
pub trait StatusIndicator: Send + Sync {
    fn on(&self);
    fn off(&self);
    fn blink(&self, period: Duration);
}

/// Indicator that only logs pattern changes
#[derive(Debug, Default)]
pub struct ConsoleIndicator;

impl StatusIndicator for ConsoleIndicator {
    fn on(&self) {
        tracing::debug!("Indicator: on");
    }

    fn off(&self) {
        tracing::debug!("Indicator: off");
    }

    fn blink(&self, period: Duration) {
        tracing::debug!("Indicator: blink every {}ms", period.as_millis());
    }
}

/// Indicator driving a sysfs LED brightness (or GPIO value) file
pub struct LedIndicator {
    path: PathBuf,
    runtime: tokio::runtime::Handle,
    blinker: Mutex<Option<JoinHandle<()>>>,
}

impl LedIndicator {
    /// Create an LED indicator; must be called inside the tokio runtime
    pub fn new(path: PathBuf) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        write_level(&path, false)?;
        Ok(Self {
            path,
            runtime,
            blinker: Mutex::new(None),
        })
    }

    fn stop_blinking(&self) {
        if let Some(task) = lock(&self.blinker).take() {
            task.abort();
        }
    }

    fn set(&self, lit: bool) {
        if let Err(e) = write_level(&self.path, lit) {
            tracing::warn!("Failed to set LED {:?}: {}", self.path, e);
        }
    }
}

fn write_level(path: &Path, lit: bool) -> std::io::Result<()> {
    std::fs::write(path, if lit { "1" } else { "0" })
}

impl StatusIndicator for LedIndicator {
    fn on(&self) {
        self.stop_blinking();
        self.set(true);
    }

    fn off(&self) {
        self.stop_blinking();
        self.set(false);
    }

    fn blink(&self, period: Duration) {
        self.stop_blinking();
        let path = self.path.clone();
        let task = self.runtime.spawn(async move {
            let mut lit = false;
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(50)));
            loop {
                ticker.tick().await;
                lit = !lit;
                if let Err(e) = write_level(&path, lit) {
                    tracing::warn!("LED blink stopped: {}", e);
                    break;
                }
            }
        });

        *lock(&self.blinker) = Some(task);
    }
}

impl Drop for LedIndicator {
    fn drop(&mut self) {
        self.stop_blinking();
    }
}

/// Build the configured indicator
pub fn create_indicator(config: &IndicatorConfig) -> std::io::Result<Arc<dyn StatusIndicator>> {
    match config.kind {
        IndicatorKind::Console => Ok(Arc::new(ConsoleIndicator)),
        IndicatorKind::Led => {
            tracing::info!("Using LED indicator at {:?}", config.led_path);
            Ok(Arc::new(LedIndicator::new(config.led_path.clone())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_led_on_off_writes_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brightness");
        let led = LedIndicator::new(path.clone()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");

        led.on();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");

        led.off();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
    }

    #[tokio::test]
    async fn test_led_blink_toggles_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brightness");
        let led = LedIndicator::new(path.clone()).unwrap();

        led.blink(Duration::from_millis(50));
        // First tick fires immediately and lights the LED
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");

        led.on();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn test_led_requires_runtime() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LedIndicator::new(dir.path().join("brightness")).is_err());
    }
}
