use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A point in a mini-protocol conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolState {
    id: u32,
    name: &'static str,
}

impl ProtocolState {
    pub const fn new(id: u32, name: &'static str) -> Self {
        ProtocolState { id, name }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Which side of a mini-protocol an instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolRole {
    Client,
    Server,
}

impl ProtocolRole {
    pub fn peer(self) -> ProtocolRole {
        match self {
            ProtocolRole::Client => ProtocolRole::Server,
            ProtocolRole::Server => ProtocolRole::Client,
        }
    }
}

impl fmt::Display for ProtocolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolRole::Client => write!(f, "client"),
            ProtocolRole::Server => write!(f, "server"),
        }
    }
}

/// The party allowed to send in a state. `None` marks a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agency {
    Client,
    Server,
    None,
}

impl Agency {
    pub fn permits(self, role: ProtocolRole) -> bool {
        matches!(
            (self, role),
            (Agency::Client, ProtocolRole::Client) | (Agency::Server, ProtocolRole::Server)
        )
    }
}

impl fmt::Display for Agency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Agency::Client => write!(f, "client"),
            Agency::Server => write!(f, "server"),
            Agency::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub message_type: u64,
    pub new_state: ProtocolState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMapEntry {
    pub agency: Agency,
    pub transitions: Vec<StateTransition>,
    /// Bound on how long the engine waits for the peer in this state.
    pub timeout: Option<Duration>,
}

impl StateMapEntry {
    pub fn new(agency: Agency) -> Self {
        StateMapEntry {
            agency,
            transitions: vec![],
            timeout: None,
        }
    }

    pub fn transition(mut self, message_type: u64, new_state: ProtocolState) -> Self {
        self.transitions.push(StateTransition {
            message_type,
            new_state,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMapError {
    #[error("terminal state {0} has outgoing transitions")]
    TerminalWithTransitions(ProtocolState),
    #[error("state {0} has agency but no transitions")]
    DeadEnd(ProtocolState),
    #[error("transition from {from} leads to unknown state {to}")]
    UnknownTarget { from: ProtocolState, to: ProtocolState },
    #[error("state {state} declares message type {message_type} more than once")]
    DuplicateTransition {
        state: ProtocolState,
        message_type: u64,
    },
}

///
/// The transition table of a mini-protocol.
///
/// One table describes both sides: a message is legal for a sender in a state
/// when the state's agency belongs to the sender and the state lists the
/// message type. The client view (send in client states, receive in server
/// states) and the server view are therefore duals of each other.
///
/// Tables are template data. Mini-protocols keep one in a static and each
/// instance clones it before changing anything.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMap {
    entries: HashMap<ProtocolState, StateMapEntry>,
}

impl StateMap {
    pub fn new() -> Self {
        StateMap {
            entries: HashMap::new(),
        }
    }

    pub fn with_state(mut self, state: ProtocolState, entry: StateMapEntry) -> Self {
        self.entries.insert(state, entry);
        self
    }

    /// Replace the timeout of one state on this copy of the table.
    pub fn with_timeout(mut self, state: ProtocolState, timeout: Option<Duration>) -> Self {
        if let Some(entry) = self.entries.get_mut(&state) {
            entry.timeout = timeout;
        }
        self
    }

    pub fn entry(&self, state: ProtocolState) -> Option<&StateMapEntry> {
        self.entries.get(&state)
    }

    pub fn states(&self) -> impl Iterator<Item = &ProtocolState> {
        self.entries.keys()
    }

    pub fn agency_of(&self, state: ProtocolState) -> Agency {
        self.entries
            .get(&state)
            .map(|entry| entry.agency)
            .unwrap_or(Agency::None)
    }

    pub fn timeout_of(&self, state: ProtocolState) -> Option<Duration> {
        self.entries.get(&state).and_then(|entry| entry.timeout)
    }

    pub fn is_terminal(&self, state: ProtocolState) -> bool {
        self.agency_of(state) == Agency::None
    }

    /// The state reached when `sender` sends `message_type` in `state`, or
    /// `None` if that message is not legal for that sender there.
    pub fn legal_transition(
        &self,
        sender: ProtocolRole,
        state: ProtocolState,
        message_type: u64,
    ) -> Option<ProtocolState> {
        let entry = self.entries.get(&state)?;
        if !entry.agency.permits(sender) {
            return None;
        }
        entry
            .transitions
            .iter()
            .find(|transition| transition.message_type == message_type)
            .map(|transition| transition.new_state)
    }

    pub fn validate(&self) -> Result<(), StateMapError> {
        for (state, entry) in &self.entries {
            if entry.agency == Agency::None {
                if !entry.transitions.is_empty() {
                    return Err(StateMapError::TerminalWithTransitions(*state));
                }
                continue;
            }
            if entry.transitions.is_empty() {
                return Err(StateMapError::DeadEnd(*state));
            }
            for (i, transition) in entry.transitions.iter().enumerate() {
                if !self.entries.contains_key(&transition.new_state) {
                    return Err(StateMapError::UnknownTarget {
                        from: *state,
                        to: transition.new_state,
                    });
                }
                if entry.transitions[..i]
                    .iter()
                    .any(|other| other.message_type == transition.message_type)
                {
                    return Err(StateMapError::DuplicateTransition {
                        state: *state,
                        message_type: transition.message_type,
                    });
                }
            }
        }
        Ok(())
    }
}
