use anyhow::Result;
use async_trait::async_trait;

use crate::{
    core::stream::MessageStream,
    peer::peer::PeerConfig,
};

/// A type for initiating a connection to a router.
///
/// Failures are reported as [`crate::core::error::TransportError`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &PeerConfig, url: &str) -> Result<Box<dyn MessageStream>>;
}

/// A type for generating a new [`Connector`] for each connection attempt.
pub trait ConnectorFactory: Send + Sync {
    fn new_connector(&self) -> Box<dyn Connector>;
}
