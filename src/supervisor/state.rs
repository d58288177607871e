//! Link state machine

use crate::{Error, Result};

/// State of the reconnect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection (initial and between attempts)
    Disconnected,

    /// Connect in progress
    Connecting,

    /// Connection and channel open, consumers being registered
    Open,

    /// Dispatching broker events
    Draining,

    /// Tearing the connection down
    Closing,
}

impl LinkState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: LinkState) -> bool {
        use LinkState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Open)
                | (Open, Draining)
                | (Draining, Open)
                | (Connecting, Closing)
                | (Open, Closing)
                | (Draining, Closing)
                | (Closing, Disconnected)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: LinkState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Draining => write!(f, "draining"),
            Self::Closing => write!(f, "closing"),
        }
    }
}
