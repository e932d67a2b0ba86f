//! GPIO button trigger
//!
//! Polls a sysfs GPIO `value` file every 25ms. A press is a rising edge that
//! stays high for the debounce time; the line must go low again before the
//! next press counts. A line that is already high at startup does not fire.

use super::{TriggerEvent, TriggerSource};
use crate::error::TriggerError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Rising-edge detector with debounce
#[derive(Debug)]
pub struct EdgeDetector {
    debounce: Duration,
    armed: bool,
    high_since: Option<Instant>,
}

impl EdgeDetector {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            armed: false,
            high_since: None,
        }
    }

    /// Feed one sample; true when it completes a press
    pub fn sample(&mut self, high: bool, now: Instant) -> bool {
        if !high {
            self.armed = true;
            self.high_since = None;
            return false;
        }
        if !self.armed {
            return false;
        }

        let since = *self.high_since.get_or_insert(now);
        if now.saturating_duration_since(since) >= self.debounce {
            self.armed = false;
            self.high_since = None;
            true
        } else {
            false
        }
    }
}

fn parse_level(contents: &str) -> bool {
    contents.trim() == "1"
}

pub struct GpioTrigger {
    path: PathBuf,
    debounce: Duration,
    cancel: Option<CancellationToken>,
}

impl GpioTrigger {
    pub fn new(path: &Path, debounce: Duration) -> Result<Self, TriggerError> {
        std::fs::read_to_string(path)
            .map_err(|e| TriggerError::Gpio(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            debounce,
            cancel: None,
        })
    }
}

#[async_trait::async_trait]
impl TriggerSource for GpioTrigger {
    async fn start(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TriggerError> {
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.replace(cancel.clone()) {
            previous.cancel();
        }

        let path = self.path.clone();
        let mut detector = EdgeDetector::new(self.debounce);

        tokio::spawn(async move {
            tracing::info!("Watching GPIO button at {}", path.display());
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            let mut read_failing = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let high = match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => {
                        read_failing = false;
                        parse_level(&contents)
                    }
                    Err(e) => {
                        if !read_failing {
                            tracing::warn!("Cannot read {}: {}", path.display(), e);
                            read_failing = true;
                        }
                        false
                    }
                };

                if detector.sample(high, Instant::now()) {
                    tracing::debug!("GPIO button pressed");
                    if tx.send(TriggerEvent::Wake).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), TriggerError> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }
}
