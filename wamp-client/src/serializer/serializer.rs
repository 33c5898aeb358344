use std::fmt::Debug;

use anyhow::{
    Context,
    Error,
    Result,
};

use crate::message::message::Message;

/// The wire format of messages on a connection, negotiated as a WebSocket sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerializerType {
    Json,
    MessagePack,
}

impl SerializerType {
    /// The sub-protocol name.
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Json => "wamp.2.json",
            Self::MessagePack => "wamp.2.msgpack",
        }
    }

    /// Whether messages travel in binary frames rather than text frames.
    pub fn binary(&self) -> bool {
        matches!(self, Self::MessagePack)
    }
}

impl TryFrom<&str> for SerializerType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "wamp.2.json" => Ok(Self::Json),
            "wamp.2.msgpack" => Ok(Self::MessagePack),
            _ => Err(Error::msg(format!("unsupported sub-protocol: {value}"))),
        }
    }
}

/// Converts messages to and from bytes.
///
/// Batched framing is not supported.
pub trait Serializer: Send + Debug {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Message>;
}

#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(message).context("failed to serialize message as JSON")
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        serde_json::from_slice(bytes).context("failed to deserialize JSON message")
    }
}

#[derive(Debug, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        rmp_serde::to_vec(message).context("failed to serialize message as MessagePack")
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Message> {
        rmp_serde::from_slice(bytes).context("failed to deserialize MessagePack message")
    }
}

pub fn new_serializer(serializer_type: SerializerType) -> Box<dyn Serializer> {
    match serializer_type {
        SerializerType::Json => Box::new(JsonSerializer),
        SerializerType::MessagePack => Box::new(MessagePackSerializer),
    }
}
