//! Agent session and its socket state machine.
//!
//! The transition table is a pure function so the connection loop, a test,
//! or a different runtime can drive it the same way.

use std::fmt;

use fleet_protocol::AgentMode;
use thiserror::Error;

/// Where the agent's single socket currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
        })
    }
}

/// Something that happened to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Backoff elapsed (or first start): dial the hub.
    Dial,
    /// TCP/TLS connect or WebSocket upgrade failed.
    ConnectFailed,
    /// WebSocket upgrade succeeded; AUTH is on its way.
    Upgraded,
    AuthAccepted,
    AuthRejected,
    AuthTimedOut,
    /// Socket error or close frame, from either side.
    TransportLost,
    /// No inbound traffic within the liveness window.
    LivenessExpired,
    /// The process is stopping.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition: {event:?} while {from}")]
pub struct TransitionError {
    pub from: SocketState,
    pub event: SessionEvent,
}

/// The transition table.
pub fn transition(from: SocketState, event: SessionEvent) -> Result<SocketState, TransitionError> {
    use SessionEvent as E;
    use SocketState as S;

    let to = match (from, event) {
        (_, E::Shutdown) => S::Disconnected,
        (S::Disconnected, E::Dial) => S::Connecting,
        (S::Connecting, E::ConnectFailed) => S::Disconnected,
        (S::Connecting, E::Upgraded) => S::Authenticating,
        (S::Authenticating, E::AuthAccepted) => S::Ready,
        (S::Authenticating, E::AuthRejected | E::AuthTimedOut) => S::Disconnected,
        (S::Authenticating | S::Ready, E::TransportLost) => S::Disconnected,
        (S::Ready, E::LivenessExpired) => S::Disconnected,
        _ => return Err(TransitionError { from, event }),
    };
    Ok(to)
}

/// Per-process agent identity and connection state.
pub struct AgentSession {
    pub device_id: String,
    pub owner_id: String,
    api_key: String,
    pub firmware_version: String,
    pub mode: AgentMode,
    state: SocketState,
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("device_id", &self.device_id)
            .field("owner_id", &self.owner_id)
            .field("api_key", &"<redacted>")
            .field("firmware_version", &self.firmware_version)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish()
    }
}

impl AgentSession {
    #[must_use]
    pub fn new(
        device_id: String,
        owner_id: String,
        api_key: String,
        firmware_version: String,
        mode: AgentMode,
    ) -> Self {
        Self {
            device_id,
            owner_id,
            api_key,
            firmware_version,
            mode,
            state: SocketState::Disconnected,
        }
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    #[must_use]
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Apply an event. An invalid transition leaves the state unchanged.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SocketState, TransitionError> {
        let next = transition(self.state, event)?;
        if next != self.state {
            tracing::debug!(from = %self.state, to = %next, ?event, "session transition");
        }
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> AgentSession {
        AgentSession::new(
            "d1".to_string(),
            "o1".to_string(),
            "k1".to_string(),
            "1.0".to_string(),
            AgentMode::Managed,
        )
    }

    #[test]
    fn happy_path_reaches_ready() {
        let mut s = session();
        assert_eq!(s.apply(SessionEvent::Dial).unwrap(), SocketState::Connecting);
        assert_eq!(s.apply(SessionEvent::Upgraded).unwrap(), SocketState::Authenticating);
        assert_eq!(s.apply(SessionEvent::AuthAccepted).unwrap(), SocketState::Ready);
        assert_eq!(s.apply(SessionEvent::TransportLost).unwrap(), SocketState::Disconnected);
    }

    #[test]
    fn auth_failures_return_to_disconnected() {
        for event in [SessionEvent::AuthRejected, SessionEvent::AuthTimedOut] {
            assert_eq!(
                transition(SocketState::Authenticating, event).unwrap(),
                SocketState::Disconnected
            );
        }
    }

    #[test]
    fn liveness_only_expires_a_ready_socket() {
        assert_eq!(
            transition(SocketState::Ready, SessionEvent::LivenessExpired).unwrap(),
            SocketState::Disconnected
        );
        assert!(transition(SocketState::Authenticating, SessionEvent::LivenessExpired).is_err());
    }

    #[test]
    fn invalid_transition_is_reported_and_state_kept() {
        let mut s = session();
        let err = s.apply(SessionEvent::AuthAccepted).unwrap_err();
        assert_eq!(err.from, SocketState::Disconnected);
        assert_eq!(s.state(), SocketState::Disconnected);
    }

    #[test]
    fn shutdown_is_accepted_from_every_state() {
        for from in [
            SocketState::Disconnected,
            SocketState::Connecting,
            SocketState::Authenticating,
            SocketState::Ready,
        ] {
            assert_eq!(
                transition(from, SessionEvent::Shutdown).unwrap(),
                SocketState::Disconnected
            );
        }
    }

    #[test]
    fn debug_redacts_api_key() {
        let rendered = format!("{:?}", session());
        assert!(!rendered.contains("k1"));
        assert!(rendered.contains("<redacted>"));
    }
}
