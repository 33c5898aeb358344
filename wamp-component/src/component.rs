use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{
    info,
    warn,
};
use wamp_client::{
    component::{
        Component,
        ConnectDetails,
        SessionContext,
    },
    core::{
        error::{
            BasicError,
            recoverable_call_error,
        },
        invocation_policy::InvocationPolicy,
        types::{
            Integer,
            List,
            Value,
        },
    },
    peer::{
        Invocation,
        LeaveDetails,
        ProcedureOptions,
        PublishedEvent,
        ReceivedEvent,
        RpcCall,
        RpcYield,
        SubscriptionOptions,
        procedure_fn,
        subscriber_fn,
    },
};

pub const ADD2_PROCEDURE: &str = "com.example.add2";
pub const COUNTER_TOPIC: &str = "com.example.oncounter";

/// The component type reported alongside results and events.
pub const COMPONENT_TYPE: &str = "Rust";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Registers `add2`, subscribes to `oncounter`, then calls and publishes in a loop.
pub struct ClientComponent {
    interval: Duration,
}

impl ClientComponent {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for ClientComponent {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

fn integer_argument(arguments: &List, index: usize) -> Result<Integer> {
    arguments
        .get(index)
        .and_then(Value::integer)
        .ok_or_else(|| {
            BasicError::InvalidArgument(format!("argument {index} must be an integer")).into()
        })
}

#[async_trait]
impl Component for ClientComponent {
    async fn on_connect(&self, details: &ConnectDetails) {
        info!("Client connected to {}: {:?}", details.url, details.extra);
    }

    async fn on_join(&self, session: SessionContext) -> Result<()> {
        let ident = session.details().authid.clone();
        info!("Connected: {:?}", session.details());
        info!("Component ID is {ident}");
        info!("Component type is {COMPONENT_TYPE}");

        let add2_ident = ident.clone();
        let add2 = procedure_fn(move |invocation: Invocation| {
            let ident = add2_ident.clone();
            async move {
                let a = integer_argument(&invocation.arguments, 0)?;
                let b = integer_argument(&invocation.arguments, 1)?;
                info!("add2 called on {ident}");
                Ok(RpcYield::with_arguments(List::from_iter([
                    Value::Integer(a + b),
                    Value::from(ident),
                    Value::from(COMPONENT_TYPE),
                ])))
            }
        });
        session
            .register(
                ADD2_PROCEDURE,
                add2,
                ProcedureOptions {
                    invocation_policy: InvocationPolicy::RoundRobin,
                    ..Default::default()
                },
            )
            .await?;
        info!("Procedure registered: {ADD2_PROCEDURE}");

        let oncounter = subscriber_fn(|event: ReceivedEvent| async move {
            let counter = integer_argument(&event.arguments, 0)?;
            let id = event.arguments.get(1).and_then(Value::string).unwrap_or_default();
            let kind = event.arguments.get(2).and_then(Value::string).unwrap_or_default();
            info!("'oncounter' event, counter value: {counter}");
            info!("from component {id} ({kind})");
            Ok(())
        });
        session
            .subscribe(COUNTER_TOPIC, oncounter, SubscriptionOptions::default())
            .await?;
        info!("Subscribed to topic 'oncounter'");

        let mut x: Integer = 0;
        let mut counter: Integer = 0;
        loop {
            match session
                .call(
                    ADD2_PROCEDURE,
                    RpcCall::with_arguments(List::from_iter([Value::Integer(x), Value::Integer(3)])),
                )
                .await
            {
                Ok(result) => {
                    info!("add2 result: {:?}", result.arguments.first());
                    info!(
                        "from component {:?} ({:?})",
                        result.arguments.get(1),
                        result.arguments.get(2)
                    );
                    x += 1;
                }
                Err(err) if recoverable_call_error(&err) => {
                    warn!("Call of {ADD2_PROCEDURE} failed, retrying: {err:#}");
                }
                Err(err) => return Err(err),
            }

            session
                .publish(
                    COUNTER_TOPIC,
                    PublishedEvent::with_arguments(List::from_iter([
                        Value::Integer(counter),
                        Value::from(ident.clone()),
                        Value::from(COMPONENT_TYPE),
                    ])),
                )
                .await?;
            info!("Published to 'oncounter' with counter {counter}");
            counter += 1;

            session.sleep(self.interval).await?;
        }
    }

    async fn on_leave(&self, details: &LeaveDetails) {
        info!("Router session closed ({details:?})");
    }

    async fn on_disconnect(&self) {
        info!("Router connection closed");
    }
}

#[cfg(test)]
mod component_test {
    use std::time::Duration;

    use test_utils::router::{
        LoopbackRouter,
        LoopbackRouterConfig,
    };
    use tokio::{
        runtime::Handle,
        sync::mpsc::unbounded_channel,
    };
    use wamp_client::{
        component::{
            Runner,
            RunnerConfig,
        },
        core::{
            error::BasicError,
            types::{
                List,
                Value,
            },
        },
        peer::{
            Peer,
            PeerConfig,
            ReceivedEvent,
            RpcCall,
            SubscriptionOptions,
            subscriber_fn,
        },
    };

    use crate::component::{
        ADD2_PROCEDURE,
        COMPONENT_TYPE,
        COUNTER_TOPIC,
        ClientComponent,
    };

    #[tokio::test]
    async fn serves_add2_and_publishes_counter() {
        test_utils::setup::setup_test_environment();

        let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
        let observer = Peer::new(
            PeerConfig::default(),
            router.connector_factory(),
            Handle::current(),
        )
        .unwrap();
        assert_matches::assert_matches!(observer.connect("loopback").await, Ok(()));
        assert_matches::assert_matches!(observer.join_realm("realm1").await, Ok(_));

        let (event_tx, mut event_rx) = unbounded_channel();
        let subscriber = subscriber_fn(move |event: ReceivedEvent| {
            let event_tx = event_tx.clone();
            async move {
                event_tx.send(event.arguments)?;
                Ok(())
            }
        });
        assert_matches::assert_matches!(
            observer
                .subscribe(COUNTER_TOPIC, subscriber, SubscriptionOptions::default())
                .await,
            Ok(_)
        );

        let runner = Runner::new(
            RunnerConfig::default(),
            ClientComponent::new(Duration::from_millis(10)),
            router.connector_factory(),
            Handle::current(),
        )
        .unwrap();
        let mut handle = runner.start();

        for expected in 0..3 {
            assert_matches::assert_matches!(event_rx.recv().await, Some(arguments) => {
                pretty_assertions::assert_eq!(
                    arguments,
                    List::from_iter([
                        Value::Integer(expected),
                        Value::from("client-1"),
                        Value::from(COMPONENT_TYPE),
                    ])
                );
            });
        }

        assert_matches::assert_matches!(
            observer
                .call(
                    ADD2_PROCEDURE,
                    RpcCall::with_arguments(List::from_iter([Value::Integer(2), Value::Integer(3)]))
                )
                .await,
            Ok(result) => {
                pretty_assertions::assert_eq!(
                    result.arguments,
                    List::from_iter([
                        Value::Integer(5),
                        Value::from("client-1"),
                        Value::from(COMPONENT_TYPE),
                    ])
                );
            }
        );
        assert_matches::assert_matches!(
            observer
                .call(
                    ADD2_PROCEDURE,
                    RpcCall::with_arguments(List::from_iter([Value::from("two")]))
                )
                .await,
            Err(err) => {
                assert_matches::assert_matches!(err.downcast_ref::<BasicError>(), Some(BasicError::InvalidArgument(_)));
            }
        );

        handle.cancel();
        assert_matches::assert_matches!(handle.join().await, Ok(()));
    }
}
