use std::{
    pin::Pin,
    task,
};

use anyhow::{
    Error,
    Result,
};
use futures_channel::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded,
};
use futures_util::{
    Sink,
    SinkExt,
    Stream,
    StreamExt,
};

use crate::{
    message::message::Message,
    serializer::serializer::Serializer,
    transport::transport::{
        Transport,
        TransportData,
    },
};

/// An item read from or written to a [`MessageStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Ping(Vec<u8>),
    Message(Message),
}

/// A connection that carries whole WAMP messages.
pub trait MessageStream:
    Stream<Item = Result<StreamMessage>> + Sink<StreamMessage, Error = Error> + Send + Unpin
{
}

/// A [`MessageStream`] that encodes messages onto a [`Transport`].
pub struct TransportMessageStream {
    transport: Box<dyn Transport>,
    serializer: Box<dyn Serializer>,
}

impl TransportMessageStream {
    pub fn new(transport: Box<dyn Transport>, serializer: Box<dyn Serializer>) -> Self {
        Self {
            transport,
            serializer,
        }
    }
}

impl MessageStream for TransportMessageStream {}

impl Stream for TransportMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let item = match futures_util::ready!(self.transport.poll_next_unpin(cx)) {
            Some(Ok(TransportData::Ping(data))) => Some(Ok(StreamMessage::Ping(data))),
            Some(Ok(TransportData::Message(data))) => Some(
                self.serializer
                    .deserialize(&data)
                    .map(StreamMessage::Message),
            ),
            Some(Err(err)) => Some(Err(err)),
            None => None,
        };
        task::Poll::Ready(item)
    }
}

impl Sink<StreamMessage> for TransportMessageStream {
    type Error = Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_ready_unpin(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: StreamMessage) -> Result<(), Self::Error> {
        let data = match item {
            StreamMessage::Ping(data) => TransportData::Ping(data),
            StreamMessage::Message(message) => {
                TransportData::Message(self.serializer.serialize(&message)?)
            }
        };
        self.transport.start_send_unpin(data)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_flush_unpin(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.transport.poll_close_unpin(cx)
    }
}

/// An in-memory [`MessageStream`], with no serialization in between.
///
/// Pings are dropped. Closing one end ends the other end's stream.
#[derive(Debug)]
pub struct DirectMessageStream {
    tx: UnboundedSender<Message>,
    rx: UnboundedReceiver<Message>,
}

impl DirectMessageStream {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

impl MessageStream for DirectMessageStream {}

impl Stream for DirectMessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        self.rx
            .poll_next_unpin(cx)
            .map(|message| message.map(|message| Ok(StreamMessage::Message(message))))
    }
}

impl Sink<StreamMessage> for DirectMessageStream {
    type Error = Error;

    fn poll_ready(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.tx.poll_ready(cx).map_err(Error::new)
    }

    fn start_send(self: Pin<&mut Self>, item: StreamMessage) -> Result<(), Self::Error> {
        match item {
            StreamMessage::Ping(_) => Ok(()),
            StreamMessage::Message(message) => self
                .tx
                .unbounded_send(message)
                .map_err(|_| Error::msg("direct message stream closed")),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn poll_close(
        self: Pin<&mut Self>,
        _: &mut task::Context<'_>,
    ) -> task::Poll<Result<(), Self::Error>> {
        self.tx.close_channel();
        task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod stream_test {
    use futures_util::{
        SinkExt,
        StreamExt,
    };

    use crate::{
        core::{
            stream::{
                DirectMessageStream,
                StreamMessage,
            },
            uri::Uri,
        },
        message::message::{
            HelloMessage,
            Message,
        },
    };

    fn hello() -> Message {
        Message::Hello(HelloMessage {
            realm: Uri::try_from("realm1").unwrap(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn direct_stream_delivers_messages_in_order() {
        let (mut a, mut b) = DirectMessageStream::pair();
        a.send(StreamMessage::Ping(vec![1])).await.unwrap();
        a.send(StreamMessage::Message(hello())).await.unwrap();
        a.send(StreamMessage::Message(hello())).await.unwrap();
        assert_matches::assert_matches!(b.next().await, Some(Ok(StreamMessage::Message(_))));
        assert_matches::assert_matches!(b.next().await, Some(Ok(StreamMessage::Message(_))));
    }

    #[tokio::test]
    async fn closing_one_end_ends_other_stream() {
        let (mut a, mut b) = DirectMessageStream::pair();
        a.close().await.unwrap();
        assert_matches::assert_matches!(b.next().await, None);
        drop(a);
        assert_matches::assert_matches!(b.send(StreamMessage::Message(hello())).await, Err(_));
    }
}

impl std::fmt::Debug for dyn MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}
