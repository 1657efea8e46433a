//! The connection lifecycle finite state machine.
//!
//! An explicit state enum threading bus-address resolution,
//! authentication, and the `Hello` call together, driven by
//! [`crate::connection::Connection`].

use std::fmt;

/// A state in the connection lifecycle.
///
/// `Connection` starts in `Disconnected` and only a successful `Hello` round
/// trip moves it to `Active`; every public method that requires a live
/// session checks for exactly that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LifecycleState {
    /// No transport, no pending attempt.
    Disconnected,
    /// Dialing the transport.
    Connecting,
    /// Running the SASL handshake.
    Authenticating,
    /// SASL succeeded; waiting for the reply to the mandatory `Hello` call.
    AwaitingHello,
    /// `Hello` succeeded; the connection has a unique bus name and serves
    /// requests normally.
    Active,
    /// A stream-level failure was observed and auto-reconnect is enabled;
    /// a reconnection attempt is scheduled or in flight.
    Degraded,
    /// `close()` is in progress: pending calls are being failed and the
    /// I/O task is being shut down.
    Closing,
    /// Fully and permanently shut down. Further `connect()` calls fail.
    Closed,
}

impl LifecycleState {
    /// Whether this state accepts `send`/`send_request`/`send_and_route`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether this state is a dead end: no further transition is possible
    /// except by constructing a new [`crate::connection::Connection`].
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticating => "AUTHENTICATING",
            Self::AwaitingHello => "AWAITING_HELLO",
            Self::Active => "ACTIVE",
            Self::Degraded => "DEGRADED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_accepts_requests() {
        assert!(LifecycleState::Active.is_active());
        assert!(!LifecycleState::Degraded.is_active());
        assert!(!LifecycleState::AwaitingHello.is_active());
    }

    #[test]
    fn closed_is_the_only_terminal_state() {
        assert!(LifecycleState::Closed.is_terminal());
        assert!(!LifecycleState::Closing.is_terminal());
    }

    #[test]
    fn display_matches_state_diagram_names() {
        assert_eq!(LifecycleState::AwaitingHello.to_string(), "AWAITING_HELLO");
        assert_eq!(LifecycleState::Degraded.to_string(), "DEGRADED");
    }
}
