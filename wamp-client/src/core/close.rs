use crate::core::uri::Uri;

/// Why a session ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    #[default]
    Normal,
    SystemShutdown,
    CloseRealm,
    Killed,
    /// Reply to a GOODBYE initiated by the other side.
    GoodbyeAndOut,
    /// The connection went away without a GOODBYE exchange.
    ///
    /// Never sent on the wire.
    TransportLost,
}

impl CloseReason {
    pub fn uri(&self) -> Uri {
        Uri::from_known(match self {
            Self::Normal => "wamp.close.normal",
            Self::SystemShutdown => "wamp.close.system_shutdown",
            Self::CloseRealm => "wamp.close.close_realm",
            Self::Killed => "wamp.close.killed",
            Self::GoodbyeAndOut => "wamp.close.goodbye_and_out",
            Self::TransportLost => "wamp.close.transport_lost",
        })
    }
}
