use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream,
    WebSocketStream,
    tungstenite::Message,
};

use crate::{
    serializer::serializer::SerializerType,
    transport::transport::{
        Transport,
        TransportData,
    },
};

/// A [`Transport`] over a client WebSocket connection.
///
/// Text frames carry JSON and binary frames carry MessagePack. A frame of the wrong kind for the
/// negotiated serializer is an error.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    binary: bool,
}

impl WebSocketTransport {
    pub fn new(
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        serializer_type: SerializerType,
    ) -> Self {
        Self {
            stream,
            binary: serializer_type.binary(),
        }
    }
}

impl Transport for WebSocketTransport {}

impl Stream for WebSocketTransport {
    type Item = Result<TransportData>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            let message = match futures_util::ready!(self.stream.poll_next_unpin(cx)) {
                Some(Ok(message)) => message,
                Some(Err(err)) => return task::Poll::Ready(Some(Err(err.into()))),
                None => return task::Poll::Ready(None),
            };
            let data = match message {
                Message::Ping(data) => TransportData::Ping(data.to_vec()),
                Message::Text(text) if !self.binary => {
                    TransportData::Message(text.as_bytes().to_vec())
                }
                Message::Binary(data) if self.binary => TransportData::Message(data.to_vec()),
                Message::Text(_) => {
                    return task::Poll::Ready(Some(Err(Error::msg(
                        "received text frame on a binary connection",
                    ))));
                }
                Message::Binary(_) => {
                    return task::Poll::Ready(Some(Err(Error::msg(
                        "received binary frame on a text connection",
                    ))));
                }
                Message::Close(_) => return task::Poll::Ready(None),
                // Pongs and raw frames carry nothing for the session.
                Message::Pong(_) | Message::Frame(_) => continue,
            };
            return task::Poll::Ready(Some(Ok(data)));
        }
    }
}

impl Sink<TransportData> for WebSocketTransport {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_ready_unpin(cx).map_err(Error::new)
    }

    fn start_send(mut self: Pin<&mut Self>, item: TransportData) -> Result<(), Self::Error> {
        let message = match item {
            TransportData::Ping(data) => Message::Pong(data.into()),
            TransportData::Message(data) if self.binary => Message::Binary(data.into()),
            TransportData::Message(data) => Message::Text(String::from_utf8(data)?.into()),
        };
        self.stream.start_send_unpin(message).map_err(Error::new)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_flush_unpin(cx).map_err(Error::new)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.stream.poll_close_unpin(cx).map_err(Error::new)
    }
}
