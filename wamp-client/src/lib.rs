//! # wamp-client
//!
//! **wamp-client** is the session core of a WAMP (Web Application Messaging Protocol) client. A
//! [`Peer`][`crate::peer::Peer`] owns one connection to a router and one realm membership at a
//! time, and exposes the four basic operations of the protocol to application code:
//!
//! 1. **register** a procedure that other sessions can call.
//! 1. **subscribe** to a topic that other sessions publish to.
//! 1. **call** a procedure and wait for its result.
//! 1. **publish** an event to a topic.
//!
//! Application logic is usually written as a [`Component`][`crate::component::Component`] and
//! driven by a [`Runner`][`crate::component::Runner`], which sequences connect, join, leave and
//! disconnect, and reconnects according to its policy.

pub mod component;
pub mod core;
pub mod message;
pub mod peer;
pub mod serializer;
pub mod transport;
