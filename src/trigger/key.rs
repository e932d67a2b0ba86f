//! Console trigger: every line on stdin (usually just Enter) is a wake trigger

use super::{TriggerEvent, TriggerSource};
use crate::error::TriggerError;
use crate::sync::lock;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type LineSource = Box<dyn AsyncRead + Send + Unpin>;

pub struct KeyTrigger {
    input: Mutex<Option<LineSource>>,
    cancel: Option<CancellationToken>,
}

impl KeyTrigger {
    /// Trigger on lines typed at the terminal
    pub fn stdin() -> Self {
        Self::from_reader(Box::new(tokio::io::stdin()))
    }

    pub fn from_reader(input: LineSource) -> Self {
        Self {
            input: Mutex::new(Some(input)),
            cancel: None,
        }
    }
}

#[async_trait::async_trait]
impl TriggerSource for KeyTrigger {
    async fn start(&mut self) -> Result<mpsc::Receiver<TriggerEvent>, TriggerError> {
        let input = lock(&self.input)
            .take()
            .ok_or_else(|| TriggerError::DeviceAccess("stdin (already in use)".to_string()))?;

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        tokio::spawn(async move {
            let mut lines = BufReader::new(input).lines();
            tracing::info!("Press Enter to talk");

            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };

                match line {
                    Ok(Some(_)) => {
                        tracing::debug!("Enter pressed");
                        if tx.send(TriggerEvent::Wake).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed, key trigger stopped");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("stdin read failed, key trigger stopped: {}", e);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_line_is_a_trigger() {
        let mut trigger = KeyTrigger::from_reader(Box::new(&b"\n\nhello\n"[..]));
        let mut rx = trigger.start().await.unwrap();

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(TriggerEvent::Wake));
        }
        // End of input closes the channel
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let mut trigger = KeyTrigger::from_reader(Box::new(&b""[..]));
        let _rx = trigger.start().await.unwrap();
        assert!(trigger.start().await.is_err());
        trigger.stop().await.unwrap();
    }
}
