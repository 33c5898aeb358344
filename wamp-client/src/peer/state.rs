use std::{
    fmt::Display,
    sync::Arc,
};

use anyhow::Result;
use log::trace;
use tokio::sync::watch;

use crate::core::error::BasicError;

/// The lifecycle state of a peer's session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No connection to a router.
    #[default]
    Disconnected,
    /// A connection is being established, or is established and waiting for a join.
    Connecting,
    /// HELLO was sent.
    Joining,
    /// The router challenged the join.
    Challenging,
    /// The session is established and may register, subscribe, call, and publish.
    Joined,
    /// GOODBYE was sent.
    Leaving,
}

impl SessionState {
    pub fn allowed_state_transition(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Joining | Self::Disconnected)
                | (Self::Joining, Self::Challenging | Self::Joined | Self::Disconnected)
                | (Self::Challenging, Self::Joined | Self::Disconnected)
                | (Self::Joined, Self::Leaving | Self::Disconnected)
                | (Self::Leaving, Self::Disconnected)
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Joining => "joining",
            Self::Challenging => "challenging",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Shared, observable [`SessionState`] of one peer.
///
/// Written only by the peer and its session actor, with every write checked against the state
/// machine.
#[derive(Debug, Clone)]
pub struct StateTracker {
    name: Arc<str>,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl StateTracker {
    pub fn new(name: &str) -> Self {
        let (state_tx, _) = watch::channel(SessionState::default());
        Self {
            name: name.into(),
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn get(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Moves to the next state, failing if the state machine does not allow it.
    pub fn transition(&self, next: SessionState) -> Result<()> {
        let mut result = Ok(());
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.allowed_state_transition(&next) {
                result = Err(BasicError::Internal(format!(
                    "invalid state transition from {state} to {next}"
                ))
                .into());
                return false;
            }
            trace!("Peer {} transitioned from {state} to {next}", self.name);
            *state = next;
            true
        });
        result
    }

    /// Waits until the state satisfies the predicate.
    pub async fn wait_for<F>(&self, predicate: F)
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut state_rx = self.subscribe();
        // The sender lives in self, so the channel cannot close while waiting.
        state_rx.wait_for(predicate).await.ok();
    }
}
