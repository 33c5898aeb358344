use std::{
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::{
        error::SessionClosed,
        types::Dictionary,
    },
    peer::{
        LeaveDetails,
        Peer,
        SessionDetails,
        SessionState,
    },
};

/// Details of a new connection, handed to [`Component::on_connect`].
#[derive(Debug, Default, Clone)]
pub struct ConnectDetails {
    pub url: String,
    pub realm: String,
    /// Metadata from [`crate::peer::PeerConfig::extra`].
    pub extra: Dictionary,
}

/// Application logic driven by a [`crate::component::Runner`].
///
/// The runner calls the hooks in lifecycle order for every connection: `on_connect`, `on_join` if
/// the realm was joined, `on_leave` when the session ends, then `on_disconnect`.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    async fn on_connect(&self, _details: &ConnectDetails) {}

    /// Runs the application for one joined session.
    ///
    /// The returned future is dropped as soon as the session ends. Returning an error ends the
    /// session.
    async fn on_join(&self, session: SessionContext) -> Result<()>;

    async fn on_leave(&self, _details: &LeaveDetails) {}

    async fn on_disconnect(&self) {}
}

/// A joined session, as seen by a [`Component`].
///
/// Dereferences to the [`Peer`] for the protocol operations.
#[derive(Clone)]
pub struct SessionContext {
    peer: Arc<Peer>,
    details: SessionDetails,
}

impl SessionContext {
    pub fn new(peer: Arc<Peer>, details: SessionDetails) -> Self {
        Self { peer, details }
    }

    pub fn details(&self) -> &SessionDetails {
        &self.details
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn extra(&self) -> &Dictionary {
        &self.peer.config().extra
    }

    /// Whether this session is still the joined session of the peer.
    pub fn active(&self) -> bool {
        self.peer
            .current_session()
            .is_some_and(|current| current.session == self.details.session)
    }

    /// Waits for the duration, or fails with [`SessionClosed`] as soon as the session ends.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let mut state_rx = self.peer.state_rx();
        if !self.active() {
            return Err(SessionClosed.into());
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = state_rx.wait_for(|state| *state != SessionState::Joined) => Err(SessionClosed.into()),
        }
    }
}

impl Deref for SessionContext {
    type Target = Peer;

    fn deref(&self) -> &Self::Target {
        &self.peer
    }
}
