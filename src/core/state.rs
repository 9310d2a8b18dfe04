use tracing::{debug, warn};

use super::types::{ConnectionState, LinkError, LinkResult};

/// An accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// Whether `from -> to` is a legal edge. Self-edges are not transitions and return false.
pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (a, b) if a == b => false,
        (Disconnected | Error | Reconnecting, Connecting) => true,
        // Connected is only reachable through a successful probe while Connecting.
        (Connecting, Connected) => true,
        (Connecting | Connected | Reconnecting, Error) => true,
        (Error | Disconnected, Reconnecting) => true,
        (_, Disconnected) => true,
        _ => false,
    }
}

/// Sole owner of the client's [`ConnectionState`].
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    transitions: u64,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transitions: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is(&self, state: ConnectionState) -> bool {
        self.state == state
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Move to `to`.
    ///
    /// Returns `Ok(None)` when already in `to` (nothing to emit) and `InvalidState` for edges
    /// outside the transition table.
    pub fn transition(&mut self, to: ConnectionState) -> LinkResult<Option<StateChange>> {
        let from = self.state;
        if from == to {
            debug!(state = %to, "connection state unchanged");
            return Ok(None);
        }
        if !can_transition(from, to) {
            warn!(from = %from, to = %to, "rejected connection state transition");
            return Err(LinkError::InvalidState(format!(
                "cannot transition from {from} to {to}"
            )));
        }

        self.state = to;
        self.transitions = self.transitions.saturating_add(1);
        Ok(Some(StateChange { old: from, new: to }))
    }
}
