use anyhow::Result;
use tokio::runtime::Handle;

use crate::peer::{
    connector::web_socket_connector::WebSocketConnectorFactory,
    peer::{
        Peer,
        PeerConfig,
    },
};

/// Creates a new [`Peer`] that connects to routers over WebSocket.
pub fn new_web_socket_peer(config: PeerConfig, runtime: Handle) -> Result<Peer> {
    Peer::new(
        config,
        Box::new(WebSocketConnectorFactory::default()),
        runtime,
    )
}
