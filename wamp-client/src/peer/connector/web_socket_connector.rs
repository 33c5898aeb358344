use std::sync::Once;

use anyhow::{
    Context,
    Error,
    Result,
};
use async_trait::async_trait;
use log::debug;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        ClientRequestBuilder,
        http::header::SEC_WEBSOCKET_PROTOCOL,
    },
};

use crate::{
    core::{
        error::TransportError,
        stream::{
            MessageStream,
            TransportMessageStream,
        },
    },
    peer::{
        connector::connector::{
            Connector,
            ConnectorFactory,
        },
        peer::PeerConfig,
    },
    serializer::serializer::{
        SerializerType,
        new_serializer,
    },
    transport::web_socket_transport::WebSocketTransport,
};

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        // Fails if the application installed its own provider, which is then used instead.
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .ok();
    });
}

#[derive(Default)]
struct WebSocketConnector {}

impl WebSocketConnector {
    async fn handshake(
        &self,
        config: &PeerConfig,
        url: &str,
    ) -> Result<Box<dyn MessageStream>> {
        let uri = url.try_into().context("invalid router URL")?;
        let mut request = ClientRequestBuilder::new(uri);
        if !config.agent.is_empty() {
            request = request.with_header("User-Agent", &config.agent);
        }
        for serializer in &config.serializers {
            request = request.with_sub_protocol(serializer.protocol());
        }
        if let Some(web_socket) = &config.web_socket {
            for (key, value) in &web_socket.headers {
                request = request.with_header(key, value);
            }
        }

        let (stream, response) = connect_async(request).await?;
        let serializer = match response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(protocol) => SerializerType::try_from(protocol.to_str()?)?,
            None => return Err(Error::msg("handshake did not produce a sub-protocol")),
        };
        if !config.serializers.contains(&serializer) {
            return Err(Error::msg(format!(
                "router selected a sub-protocol that was not offered: {}",
                serializer.protocol()
            )));
        }
        debug!(
            "Peer {} negotiated {} with {url}",
            config.name,
            serializer.protocol()
        );

        let transport = WebSocketTransport::new(stream, serializer);
        Ok(Box::new(TransportMessageStream::new(
            Box::new(transport),
            new_serializer(serializer),
        )))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, config: &PeerConfig, url: &str) -> Result<Box<dyn MessageStream>> {
        install_crypto_provider();
        self.handshake(config, url)
            .await
            .map_err(|err| TransportError::new(format!("failed to connect to {url}: {err:#}")).into())
    }
}

/// A factory for generating [`Connector`]s for WebSocket connections.
#[derive(Default)]
pub struct WebSocketConnectorFactory {}

impl ConnectorFactory for WebSocketConnectorFactory {
    fn new_connector(&self) -> Box<dyn Connector> {
        Box::new(WebSocketConnector::default())
    }
}
