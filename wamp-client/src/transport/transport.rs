use std::fmt::Debug;

use anyhow::{
    Error,
    Result,
};
use futures_util::{
    Sink,
    Stream,
};

/// A unit of data read from or written to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportData {
    /// A keep-alive ping. Received pings are written back as pongs.
    Ping(Vec<u8>),
    /// One encoded WAMP message.
    Message(Vec<u8>),
}

/// A bidirectional, message-framed connection to a router.
///
/// The stream ends when the connection closes. Framing violations surface as stream errors.
pub trait Transport:
    Send + Stream<Item = Result<TransportData>> + Sink<TransportData, Error = Error> + Unpin + Debug
{
}
