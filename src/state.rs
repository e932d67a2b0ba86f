//! Connection state machine for the session link
//!
//! NotConnected → Connecting → Connected → Ready, with Closing and
//! NotConnected reachable from anywhere.

/// State of the link to the session server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport; the session loop will fetch a token and connect
    #[default]
    NotConnected,

    /// Connect issued, waiting for the transport to open
    Connecting,

    /// Transport open, option messages being sent
    Connected,

    /// Options sent, captures may start
    Ready,

    /// Close handshake in progress
    Closing,
}

impl ConnectionState {
    /// Check if in ready state
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Check whether the transport is open (messages may be sent)
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Ready)
    }

    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Ready is only reachable from Connected. Any state may drop to
    /// NotConnected or begin Closing. Re-entering the current state is legal.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if *self == next {
            return true;
        }

        match next {
            NotConnected | Closing => true,
            Connecting => matches!(self, NotConnected),
            Connected => matches!(self, Connecting),
            Ready => matches!(self, Connected),
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::NotConnected => write!(f, "NOT_CONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Ready => write!(f, "READY"),
            ConnectionState::Closing => write!(f, "CLOSING"),
        }
    }
}
