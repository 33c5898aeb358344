use std::time::Duration;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    SinkExt,
    StreamExt,
    future,
};
use log::{
    debug,
    error,
    trace,
};
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::InteractionError,
        stream::{
            MessageStream,
            StreamMessage,
        },
    },
    message::{
        common::abort_message_for_error,
        message::Message,
    },
};

/// A handle to a running [`Service`].
pub struct ServiceHandle {
    join_handle: JoinHandle<()>,
    cancel_tx: Option<oneshot::Sender<()>>,
    message_tx: UnboundedSender<Message>,
}

impl ServiceHandle {
    /// The channel for messages to write to the connection.
    pub fn message_tx(&self) -> UnboundedSender<Message> {
        self.message_tx.clone()
    }

    /// Stops the service after writing out every message sent before this call.
    pub fn cancel(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            cancel_tx.send(()).ok();
        }
    }

    /// Whether the service has ended.
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Waits for the service to end.
    pub async fn join(self) -> Result<()> {
        self.join_handle.await.map_err(Error::new)
    }
}

/// The I/O task of one connection.
///
/// Reads messages from the stream and hands them to the layer above in arrival order, answers
/// pings, and writes outbound messages. The service never decides to end a session by itself: the
/// layer above sends ABORT or GOODBYE before canceling it. The inbound channel closes when the
/// service ends, for whatever reason.
pub struct Service {
    name: String,
    stream: Box<dyn MessageStream>,
    inbound_tx: UnboundedSender<Message>,
    outbound_rx: UnboundedReceiver<Message>,
    cancel_rx: oneshot::Receiver<()>,
    idle_timeout: Option<Duration>,
}

impl Service {
    /// Starts a service for the stream on the runtime.
    ///
    /// Returns the handle and the channel of received messages. With an idle timeout, the service
    /// fails once no message has been read or written for that long.
    pub fn start(
        name: String,
        stream: Box<dyn MessageStream>,
        idle_timeout: Option<Duration>,
        runtime: &Handle,
    ) -> (ServiceHandle, UnboundedReceiver<Message>) {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let (message_tx, outbound_rx) = unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let service = Self {
            name,
            stream,
            inbound_tx,
            outbound_rx,
            cancel_rx,
            idle_timeout,
        };
        let join_handle = runtime.spawn(service.run());
        (
            ServiceHandle {
                join_handle,
                cancel_tx: Some(cancel_tx),
                message_tx,
            },
            inbound_rx,
        )
    }

    async fn run(mut self) {
        match self.service_loop().await {
            Ok(()) => debug!("Service {} finished", self.name),
            Err(err) => error!("Service {} failed: {err:#}", self.name),
        }
        // The stream may already be closed.
        self.stream.close().await.ok();
    }

    async fn service_loop(&mut self) -> Result<()> {
        let idle_timeout = self.idle_timeout;
        loop {
            tokio::select! {
                message = self.stream.next() => {
                    match message {
                        Some(Ok(StreamMessage::Ping(data))) => {
                            self.stream.send(StreamMessage::Ping(data)).await?;
                        }
                        Some(Ok(StreamMessage::Message(message))) => {
                            trace!("Service {} received {}: {message:?}", self.name, message.message_name());
                            if self.inbound_tx.send(message).is_err() {
                                return Ok(());
                            }
                        }
                        Some(Err(err)) => {
                            // Tell the other side why the connection is going away, if it is still listening.
                            let abort = abort_message_for_error(
                                &InteractionError::ProtocolViolation(format!("{err:#}")).into(),
                            );
                            self.stream.send(StreamMessage::Message(abort)).await.ok();
                            return Err(err);
                        }
                        None => return Ok(()),
                    }
                }
                message = self.outbound_rx.recv() => {
                    match message {
                        Some(message) => self.write(message).await?,
                        None => return Ok(()),
                    }
                }
                _ = &mut self.cancel_rx => {
                    while let Ok(message) = self.outbound_rx.try_recv() {
                        self.write(message).await?;
                    }
                    return Ok(());
                }
                _ = Self::idle(idle_timeout) => {
                    return Err(Error::msg("connection timed out"));
                }
            }
        }
    }

    async fn idle(timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => future::pending().await,
        }
    }

    async fn write(&mut self, message: Message) -> Result<()> {
        trace!("Service {} sending {}: {message:?}", self.name, message.message_name());
        self.stream.send(StreamMessage::Message(message)).await
    }
}

#[cfg(test)]
mod service_test {
    use std::time::Duration;

    use futures_util::{
        SinkExt,
        StreamExt,
    };
    use tokio::runtime::Handle;

    use crate::{
        core::{
            service::Service,
            stream::{
                DirectMessageStream,
                StreamMessage,
            },
            uri::Uri,
        },
        message::message::{
            GoodbyeMessage,
            Message,
        },
    };

    fn goodbye() -> Message {
        Message::Goodbye(GoodbyeMessage {
            reason: Uri::try_from("wamp.close.normal").unwrap(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn forwards_messages_both_ways() {
        let (local, mut remote) = DirectMessageStream::pair();
        let (handle, mut inbound_rx) =
            Service::start("test".to_owned(), Box::new(local), None, &Handle::current());

        remote.send(StreamMessage::Message(goodbye())).await.unwrap();
        assert_eq!(inbound_rx.recv().await, Some(goodbye()));

        handle.message_tx().send(goodbye()).unwrap();
        assert_matches::assert_matches!(remote.next().await, Some(Ok(StreamMessage::Message(message))) => {
            assert_eq!(message, goodbye());
        });
    }

    #[tokio::test]
    async fn cancel_flushes_outbound_messages_and_closes_stream() {
        let (local, mut remote) = DirectMessageStream::pair();
        let (mut handle, mut inbound_rx) =
            Service::start("test".to_owned(), Box::new(local), None, &Handle::current());

        handle.message_tx().send(goodbye()).unwrap();
        handle.cancel();
        handle.join().await.unwrap();

        assert_matches::assert_matches!(remote.next().await, Some(Ok(StreamMessage::Message(_))));
        assert_matches::assert_matches!(remote.next().await, None);
        assert_eq!(inbound_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_while_idle_without_timeout() {
        let (local, mut remote) = DirectMessageStream::pair();
        let (handle, mut inbound_rx) =
            Service::start("test".to_owned(), Box::new(local), None, &Handle::current());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!handle.is_finished());

        remote.send(StreamMessage::Message(goodbye())).await.unwrap();
        assert_eq!(inbound_rx.recv().await, Some(goodbye()));
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_configured_idle_timeout() {
        let (local, mut remote) = DirectMessageStream::pair();
        let (handle, mut inbound_rx) = Service::start(
            "test".to_owned(),
            Box::new(local),
            Some(Duration::from_secs(10)),
            &Handle::current(),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        remote.send(StreamMessage::Message(goodbye())).await.unwrap();
        assert_eq!(inbound_rx.recv().await, Some(goodbye()));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!handle.is_finished());

        assert_eq!(inbound_rx.recv().await, None);
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn ends_when_remote_closes() {
        let (local, mut remote) = DirectMessageStream::pair();
        let (handle, mut inbound_rx) =
            Service::start("test".to_owned(), Box::new(local), None, &Handle::current());
        remote.close().await.unwrap();
        assert_eq!(inbound_rx.recv().await, None);
        handle.join().await.unwrap();
    }
}
