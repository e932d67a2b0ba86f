//! Connection state object
//!
//! Owns the current [`ConnectionState`] and performs the side effects of
//! each transition (controller status push and indicator pattern) under a
//! single lock, so observers never see a state without its announcement.

use crate::control::{StatusPush, StatusSink};
use crate::state::ConnectionState;
use crate::status::StatusIndicator;
use crate::sync::lock;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Minimum spacing of repeated pushes for an unchanged state
pub const STATUS_REPUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Indicator pattern for a state: blink period, or None for off
pub fn indicator_pattern(state: ConnectionState) -> Option<Duration> {
    match state {
        ConnectionState::NotConnected => Some(Duration::from_millis(750)),
        ConnectionState::Connecting => Some(Duration::from_millis(1500)),
        ConnectionState::Connected => Some(Duration::from_millis(1750)),
        ConnectionState::Ready => None,
        ConnectionState::Closing => Some(Duration::from_millis(300)),
    }
}

pub struct ConnectionLink {
    state_tx: watch::Sender<ConnectionState>,
    last_push: Mutex<Option<Instant>>,
    status: Arc<dyn StatusSink>,
    indicator: Arc<dyn StatusIndicator>,
}

impl ConnectionLink {
    pub fn new(status: Arc<dyn StatusSink>, indicator: Arc<dyn StatusIndicator>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::NotConnected);
        Self {
            state_tx,
            last_push: Mutex::new(None),
            status,
            indicator,
        }
    }

    fn last_push(&self) -> MutexGuard<'_, Option<Instant>> {
        lock(&self.last_push)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Move to `next`, announcing it
    ///
    /// Returns false (and changes nothing) for an illegal transition. A
    /// transition to the current state is re-announced only when the last
    /// announcement is older than [`STATUS_REPUSH_INTERVAL`].
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut last_push = self.last_push();
        let current = self.state();

        if !current.can_transition_to(next) {
            tracing::warn!("Ignoring connection transition {} -> {}", current, next);
            return false;
        }

        let changed = current != next;
        let stale = last_push.map_or(true, |at| at.elapsed() >= STATUS_REPUSH_INTERVAL);
        if !changed && !stale {
            return true;
        }

        if changed {
            self.state_tx.send_replace(next);
            tracing::info!("Server connection: {} -> {}", current, next);
        }

        self.status.push(StatusPush::for_state(next));
        match indicator_pattern(next) {
            Some(period) => self.indicator.blink(period),
            None => self.indicator.off(),
        }
        *last_push = Some(Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ConsoleIndicator;

    #[derive(Default)]
    struct Pushes(Mutex<Vec<StatusPush>>);

    impl StatusSink for Pushes {
        fn push(&self, status: StatusPush) {
            self.0.lock().unwrap().push(status);
        }
    }

    fn link() -> (ConnectionLink, Arc<Pushes>) {
        let pushes = Arc::new(Pushes::default());
        (
            ConnectionLink::new(pushes.clone(), Arc::new(ConsoleIndicator)),
            pushes,
        )
    }

    #[tokio::test]
    async fn test_transition_pushes_status() {
        let (link, pushes) = link();
        assert!(link.transition(ConnectionState::Connecting));
        assert!(link.transition(ConnectionState::Connected));
        assert!(link.transition(ConnectionState::Ready));
        assert_eq!(
            *pushes.0.lock().unwrap(),
            vec![
                StatusPush::ServerConnecting,
                StatusPush::ServerConnected,
                StatusPush::ServerConnectionReady
            ]
        );
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let (link, pushes) = link();
        assert!(!link.transition(ConnectionState::Ready));
        assert_eq!(link.state(), ConnectionState::NotConnected);
        assert!(pushes.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_state_repush_is_throttled() {
        let (link, pushes) = link();
        link.transition(ConnectionState::NotConnected);
        link.transition(ConnectionState::NotConnected);
        assert_eq!(pushes.0.lock().unwrap().len(), 1);

        tokio::time::advance(STATUS_REPUSH_INTERVAL).await;
        link.transition(ConnectionState::NotConnected);
        assert_eq!(pushes.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let (link, _) = link();
        let mut rx = link.subscribe();
        link.transition(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn test_indicator_patterns() {
        assert_eq!(indicator_pattern(ConnectionState::Ready), None);
        assert_eq!(
            indicator_pattern(ConnectionState::Closing),
            Some(Duration::from_millis(300))
        );
    }
}
