/// Session lifecycle states.
///
/// Failed is terminal: a session that hit an I/O or protocol error is never
/// reused. A server-reported error payload does not change the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected and ready for a command. A session is only observable
    /// once the handshake completed, so this is the initial state.
    Idle,
    /// One request/reply exchange in flight.
    Querying,
    /// A side-channel kill has been requested for the in-flight exchange.
    Canceling,
    /// Fatal error observed; session must be discarded.
    Failed,
    /// Cleanly shut down.
    Closed,
}

impl SessionState {
    /// Whether the session can start a new exchange.
    pub fn is_idle(self) -> bool {
        self == SessionState::Idle
    }

    /// Whether the session holds a live connection in any form.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Querying | SessionState::Canceling
        )
    }

    /// Whether the session can never be used again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}
