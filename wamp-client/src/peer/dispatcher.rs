use std::sync::Arc;

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    warn,
};
use tokio::{
    runtime::Handle,
    sync::mpsc::{
        UnboundedReceiver,
        UnboundedSender,
        unbounded_channel,
    },
    task::JoinHandle,
};

use crate::{
    core::{
        error::BasicError,
        id::Id,
    },
    peer::{
        handler::{
            Invocation,
            Procedure,
            ReceivedEvent,
            Subscriber,
        },
        session::Command,
    },
};

/// Work for application handlers, in the order the router sent it.
pub(crate) enum Dispatch {
    Invocation {
        request: Id,
        handler: Arc<dyn Procedure>,
        invocation: Invocation,
    },
    Event {
        handler: Arc<dyn Subscriber>,
        event: ReceivedEvent,
    },
}

/// The dispatch queue of one joined session.
///
/// A single task drains the queue, running one handler at a time. Each handler runs in its own
/// task so that a panic is reported as an error instead of tearing down the queue. Dropping the
/// dispatcher stops the queue and any running handler.
pub(crate) struct Dispatcher {
    queue_tx: UnboundedSender<Dispatch>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn start(name: String, runtime: Handle, command_tx: UnboundedSender<Command>) -> Self {
        let (queue_tx, queue_rx) = unbounded_channel();
        let task = runtime.spawn(Self::run(name, runtime.clone(), queue_rx, command_tx));
        Self { queue_tx, task }
    }

    pub fn push(&self, dispatch: Dispatch) {
        // The queue only closes when the task is aborted, at which point the work is moot.
        self.queue_tx.send(dispatch).ok();
    }

    async fn run(
        name: String,
        runtime: Handle,
        mut queue_rx: UnboundedReceiver<Dispatch>,
        command_tx: UnboundedSender<Command>,
    ) {
        while let Some(dispatch) = queue_rx.recv().await {
            match dispatch {
                Dispatch::Invocation {
                    request,
                    handler,
                    invocation,
                } => {
                    debug!(
                        "Peer {name} invoking {} for request {request}",
                        invocation.procedure
                    );
                    let result = Self::isolated(&runtime, async move {
                        handler.invoke(invocation).await
                    })
                    .await;
                    if command_tx.send(Command::Yield { request, result }).is_err() {
                        return;
                    }
                }
                Dispatch::Event { handler, event } => {
                    let topic = event.topic.clone();
                    let publication = event.publication;
                    let result =
                        Self::isolated(&runtime, async move { handler.handle_event(event).await })
                            .await;
                    if let Err(err) = result {
                        warn!(
                            "Peer {name} subscriber for {topic} failed on publication {publication}: {err:#}"
                        );
                    }
                }
            }
        }
    }

    /// Runs the handler future to completion in its own task.
    async fn isolated<F, T>(runtime: &Handle, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handle = runtime.spawn(future);
        let _abort = scopeguard::guard(handle.abort_handle(), |handle| handle.abort());
        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                Err(BasicError::Internal("handler panicked".to_owned()).into())
            }
            Err(err) => Err(Error::new(err)),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod dispatcher_test {
    use std::{
        sync::{
            Arc,
            Mutex,
        },
        time::Duration,
    };

    use anyhow::Error;
    use tokio::{
        runtime::Handle,
        sync::mpsc::unbounded_channel,
    };

    use crate::{
        core::{
            id::Id,
            types::{
                List,
                Value,
            },
            uri::Uri,
        },
        peer::{
            dispatcher::{
                Dispatch,
                Dispatcher,
            },
            handler::{
                Invocation,
                ReceivedEvent,
                RpcYield,
                procedure_fn,
                subscriber_fn,
            },
            session::Command,
        },
    };

    fn event(counter: u64) -> ReceivedEvent {
        ReceivedEvent {
            topic: Uri::try_from("com.example.oncounter").unwrap(),
            publication: Id::try_from(counter + 1).unwrap(),
            arguments: List::from_iter([Value::Integer(counter)]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn runs_handlers_one_at_a_time_in_order() {
        let (command_tx, _command_rx) = unbounded_channel();
        let dispatcher = Dispatcher::start("test".to_owned(), Handle::current(), command_tx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = subscriber_fn({
            let seen = seen.clone();
            move |event: ReceivedEvent| {
                let seen = seen.clone();
                async move {
                    let counter = event.arguments[0].integer().unwrap_or_default();
                    // Later events would overtake earlier ones if handlers overlapped.
                    tokio::time::sleep(Duration::from_millis(10 * (5 - counter))).await;
                    seen.lock().unwrap().push(counter);
                    Ok(())
                }
            }
        });
        for counter in 0..5 {
            dispatcher.push(Dispatch::Event {
                handler: handler.clone(),
                event: event(counter),
            });
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        pretty_assertions::assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn reports_procedure_results_and_panics() {
        let (command_tx, mut command_rx) = unbounded_channel();
        let dispatcher = Dispatcher::start("test".to_owned(), Handle::current(), command_tx);
        dispatcher.push(Dispatch::Invocation {
            request: Id::try_from(1).unwrap(),
            handler: procedure_fn(|invocation: Invocation| async move {
                Ok(RpcYield::with_arguments(invocation.arguments))
            }),
            invocation: Invocation {
                arguments: List::from_iter([Value::Integer(5)]),
                ..Default::default()
            },
        });
        dispatcher.push(Dispatch::Invocation {
            request: Id::try_from(2).unwrap(),
            handler: procedure_fn(|_: Invocation| async move {
                if true {
                    panic!("boom");
                }
                Err::<RpcYield, _>(Error::msg("unreachable"))
            }),
            invocation: Invocation::default(),
        });

        assert_matches::assert_matches!(command_rx.recv().await, Some(Command::Yield { request, result: Ok(output) }) => {
            assert_eq!(request.value(), 1);
            assert_eq!(output.arguments, List::from_iter([Value::Integer(5)]));
        });
        assert_matches::assert_matches!(command_rx.recv().await, Some(Command::Yield { request, result: Err(err) }) => {
            assert_eq!(request.value(), 2);
            assert!(err.to_string().contains("handler panicked"));
        });
    }
}
