use std::{
    future::Future,
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{
    id::Id,
    types::{
        Dictionary,
        List,
    },
    uri::Uri,
};

/// A call of a registered procedure, as received by the callee.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Invocation {
    /// The concrete procedure that was called.
    pub procedure: Uri,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

/// The result of a procedure, sent back to the caller.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcYield {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl RpcYield {
    pub fn with_arguments(arguments: List) -> Self {
        Self {
            arguments,
            ..Default::default()
        }
    }
}

/// An event, as received by a subscriber.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReceivedEvent {
    /// The concrete topic the event was published to.
    pub topic: Uri,
    pub publication: Id,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

/// A procedure that other sessions can call.
///
/// The returned error is sent to the caller; see [`crate::core::error::error_uri`] for how it is
/// named on the wire.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield>;
}

/// A receiver of events published to a topic.
///
/// Errors are logged and dropped. They never affect the session or later deliveries.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle_event(&self, event: ReceivedEvent) -> Result<()>;
}

struct ProcedureFn<F>(F);

#[async_trait]
impl<F, Fut> Procedure for ProcedureFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RpcYield>> + Send,
{
    async fn invoke(&self, invocation: Invocation) -> Result<RpcYield> {
        (self.0)(invocation).await
    }
}

struct SubscriberFn<F>(F);

#[async_trait]
impl<F, Fut> Subscriber for SubscriberFn<F>
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle_event(&self, event: ReceivedEvent) -> Result<()> {
        (self.0)(event).await
    }
}

/// Wraps an async closure as a [`Procedure`].
pub fn procedure_fn<F, Fut>(f: F) -> Arc<dyn Procedure>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RpcYield>> + Send + 'static,
{
    Arc::new(ProcedureFn(f))
}

/// Wraps an async closure as a [`Subscriber`].
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(SubscriberFn(f))
}
