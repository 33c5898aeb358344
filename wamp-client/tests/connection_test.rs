use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use test_utils::router::{
    LoopbackRouter,
    LoopbackRouterConfig,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use tokio::runtime::Handle;
use wamp_client::{
    core::{
        error::{
            AuthenticationRefused,
            InteractionError,
            SessionClosed,
            TransportError,
            session_fatal_error,
        },
        id::Id,
        stream::{
            DirectMessageStream,
            StreamMessage,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::InvalidUri,
    },
    message::message::{
        Message,
        WelcomeMessage,
    },
    peer::{
        Invocation,
        Peer,
        PeerConfig,
        ProcedureOptions,
        PublishedEvent,
        RpcCall,
        RpcYield,
        SessionState,
        procedure_fn,
    },
};

const REALM: &str = "realm1";

fn create_peer(router: &LoopbackRouter, name: &str) -> Result<Peer, Error> {
    Peer::new(
        PeerConfig {
            name: name.to_owned(),
            ..Default::default()
        },
        router.connector_factory(),
        Handle::current(),
    )
}

fn echo() -> Arc<dyn wamp_client::peer::Procedure> {
    procedure_fn(|invocation: Invocation| async move {
        Ok(RpcYield::with_arguments(invocation.arguments))
    })
}

#[tokio::test]
async fn joins_and_leaves_realm() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();
    assert_eq!(peer.state(), SessionState::Disconnected);

    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
    assert_eq!(peer.state(), SessionState::Connecting);
    assert_eq!(router.connection_count(), 1);

    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(details) => {
        assert_eq!(details.realm.as_str(), REALM);
        assert_eq!(details.authid, "client-0");
        assert_eq!(details.authrole, "anonymous");
        assert_eq!(details.authmethod, "anonymous");
        assert!(details.router_supports("dealer", "call_canceling"));
        assert_eq!(peer.current_session(), Some(details));
    });
    assert_eq!(peer.state(), SessionState::Joined);
    assert_eq!(router.session_count(), 1);

    // A second join on the same session is not allowed.
    assert_matches::assert_matches!(peer.join_realm(REALM).await, Err(_));
    assert_eq!(peer.state(), SessionState::Joined);

    let mut session_finished_rx = peer.session_finished_rx();
    assert_matches::assert_matches!(peer.leave_realm().await, Ok(details) => {
        assert_eq!(details.reason.as_str(), "wamp.close.goodbye_and_out");
    });
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert_eq!(peer.current_session(), None);
    assert_matches::assert_matches!(session_finished_rx.recv().await, Ok(details) => {
        assert_eq!(details.reason.as_str(), "wamp.close.goodbye_and_out");
    });
    test_utils::wait::wait_until(|| router.connection_count() == 0).await;
}

#[tokio::test]
async fn rejoins_after_leaving() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();

    for _ in 0..3 {
        assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
        assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(_));
        assert_matches::assert_matches!(
            peer.register("com.example.echo", echo(), ProcedureOptions::default())
                .await,
            Ok(_)
        );
        assert_matches::assert_matches!(
            peer.call(
                "com.example.echo",
                RpcCall::with_arguments(List::from_iter([Value::from("hello")]))
            )
            .await,
            Ok(result) => {
                pretty_assertions::assert_eq!(result.arguments, List::from_iter([Value::from("hello")]));
            }
        );
        assert_matches::assert_matches!(peer.leave_realm().await, Ok(_));
        test_utils::wait::wait_until(|| router.callee_count("com.example.echo") == 0).await;
    }
}

#[tokio::test]
async fn joins_over_direct_connection() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();
    assert_matches::assert_matches!(peer.direct_connect(router.direct_connect()).await, Ok(()));
    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(_));
    assert_matches::assert_matches!(peer.disconnect().await, Ok(()));
    assert_eq!(peer.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn refuses_authentication_challenge() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(
        LoopbackRouterConfig {
            challenge: Some("ticket".to_owned()),
            ..Default::default()
        },
        Handle::current(),
    );
    let peer = create_peer(&router, "peer").unwrap();
    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));

    assert_matches::assert_matches!(peer.join_realm(REALM).await, Err(err) => {
        assert_matches::assert_matches!(err.downcast_ref::<AuthenticationRefused>(), Some(err) => {
            assert_eq!(err.auth_method, "ticket");
        });
        assert!(session_fatal_error(&err));
    });
    assert_eq!(peer.state(), SessionState::Disconnected);
    assert_eq!(peer.current_session(), None);
    assert_eq!(router.session_count(), 0);
}

#[tokio::test]
async fn fails_to_join_unknown_realm() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();
    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));

    assert_matches::assert_matches!(peer.join_realm("realm2").await, Err(err) => {
        assert_matches::assert_matches!(
            err.downcast_ref::<InteractionError>(),
            Some(InteractionError::NoSuchRealm)
        );
    });
    assert_eq!(peer.state(), SessionState::Disconnected);

    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
    assert_matches::assert_matches!(peer.join_realm("not a realm").await, Err(err) => {
        assert!(err.is::<InvalidUri>());
    });
    assert_eq!(peer.state(), SessionState::Connecting);
}

#[tokio::test]
async fn fails_to_connect_when_router_is_offline() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    router.set_online(false);
    let peer = create_peer(&router, "peer").unwrap();

    assert_matches::assert_matches!(peer.connect("loopback").await, Err(err) => {
        assert!(err.is::<TransportError>());
        assert!(session_fatal_error(&err));
    });
    assert_eq!(peer.state(), SessionState::Disconnected);

    router.set_online(true);
    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
}

#[tokio::test]
async fn operations_fail_without_joined_session() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();

    assert_matches::assert_matches!(peer.call("com.example.echo", RpcCall::default()).await, Err(err) => {
        assert!(err.is::<SessionClosed>());
    });
    assert_matches::assert_matches!(peer.leave_realm().await, Err(err) => {
        assert!(err.is::<SessionClosed>());
    });

    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
    assert_matches::assert_matches!(
        peer.register("com.example.echo", echo(), ProcedureOptions::default())
            .await,
        Err(err) => {
            assert!(err.is::<SessionClosed>());
        }
    );
    assert_matches::assert_matches!(
        peer.publish("com.example.oncounter", Default::default()).await,
        Err(err) => {
            assert!(err.is::<SessionClosed>());
        }
    );
}

#[tokio::test]
async fn transport_loss_ends_session_and_pending_calls() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let caller = Arc::new(create_peer(&router, "caller").unwrap());
    let callee = create_peer(&router, "callee").unwrap();
    for peer in [caller.as_ref(), &callee] {
        assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
        assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(_));
    }
    let slow = procedure_fn(|_: Invocation| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(RpcYield::default())
    });
    assert_matches::assert_matches!(
        callee
            .register("com.example.slow", slow, ProcedureOptions::default())
            .await,
        Ok(_)
    );

    let mut session_finished_rx = caller.session_finished_rx();
    let call = tokio::spawn({
        let caller = caller.clone();
        async move { caller.call("com.example.slow", RpcCall::default()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    router.drop_connections();
    assert_matches::assert_matches!(call.await.unwrap(), Err(err) => {
        assert!(err.is::<SessionClosed>());
    });
    assert_matches::assert_matches!(session_finished_rx.recv().await, Ok(details) => {
        assert_eq!(details.reason.as_str(), "wamp.close.transport_lost");
    });
    assert_eq!(caller.state(), SessionState::Disconnected);
    assert_matches::assert_matches!(
        caller.call("com.example.slow", RpcCall::default()).await,
        Err(err) => {
            assert!(err.is::<SessionClosed>());
        }
    );
}

#[tokio::test(start_paused = true)]
async fn idle_session_stays_joined() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();
    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(_));

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(peer.state(), SessionState::Joined);
    assert_matches::assert_matches!(
        peer.publish("com.example.oncounter", PublishedEvent::default()).await,
        Ok(())
    );
}

#[tokio::test(start_paused = true)]
async fn configured_idle_timeout_drops_silent_connection() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = Peer::new(
        PeerConfig {
            name: "peer".to_owned(),
            idle_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        },
        router.connector_factory(),
        Handle::current(),
    )
    .unwrap();
    assert_matches::assert_matches!(peer.connect("loopback").await, Ok(()));
    assert_matches::assert_matches!(peer.join_realm(REALM).await, Ok(_));

    let mut session_finished_rx = peer.session_finished_rx();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(peer.state(), SessionState::Joined);

    assert_matches::assert_matches!(session_finished_rx.recv().await, Ok(details) => {
        assert_eq!(details.reason.as_str(), "wamp.close.transport_lost");
    });
    assert_eq!(peer.state(), SessionState::Disconnected);
}

async fn next_message(remote: &mut DirectMessageStream) -> Message {
    match remote.next().await {
        Some(Ok(StreamMessage::Message(message))) => message,
        item => panic!("expected a message, got {item:?}"),
    }
}

#[tokio::test]
async fn rejected_join_keeps_request_ids_of_joined_session() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();
    let (local, mut remote) = DirectMessageStream::pair();
    assert_matches::assert_matches!(peer.direct_connect(Box::new(local)).await, Ok(()));

    let welcome = async {
        assert_matches::assert_matches!(next_message(&mut remote).await, Message::Hello(_));
        remote
            .send(StreamMessage::Message(Message::Welcome(WelcomeMessage {
                session: Id::try_from(7).unwrap(),
                details: Dictionary::from_iter([("authid".to_owned(), Value::from("scripted"))]),
            })))
            .await
            .unwrap();
    };
    let (joined, ()) = tokio::join!(peer.join_realm(REALM), welcome);
    assert_matches::assert_matches!(joined, Ok(details) => {
        assert_eq!(details.authid, "scripted");
    });

    assert_matches::assert_matches!(
        peer.publish("com.example.first", PublishedEvent::default()).await,
        Ok(())
    );
    assert_matches::assert_matches!(next_message(&mut remote).await, Message::Publish(message) => {
        assert_eq!(message.request.value(), 1);
    });

    assert_matches::assert_matches!(peer.join_realm(REALM).await, Err(_));

    assert_matches::assert_matches!(
        peer.publish("com.example.second", PublishedEvent::default()).await,
        Ok(())
    );
    assert_matches::assert_matches!(next_message(&mut remote).await, Message::Publish(message) => {
        assert_eq!(message.request.value(), 2);
    });
}

#[tokio::test]
async fn new_connection_starts_request_ids_over() {
    test_utils::setup::setup_test_environment();

    let router = LoopbackRouter::new(LoopbackRouterConfig::default(), Handle::current());
    let peer = create_peer(&router, "peer").unwrap();

    for _ in 0..2 {
        let (local, mut remote) = DirectMessageStream::pair();
        assert_matches::assert_matches!(peer.direct_connect(Box::new(local)).await, Ok(()));
        let welcome = async {
            assert_matches::assert_matches!(next_message(&mut remote).await, Message::Hello(_));
            remote
                .send(StreamMessage::Message(Message::Welcome(WelcomeMessage {
                    session: Id::try_from(7).unwrap(),
                    details: Dictionary::default(),
                })))
                .await
                .unwrap();
        };
        let (joined, ()) = tokio::join!(peer.join_realm(REALM), welcome);
        assert_matches::assert_matches!(joined, Ok(_));

        assert_matches::assert_matches!(
            peer.publish("com.example.oncounter", PublishedEvent::default()).await,
            Ok(())
        );
        assert_matches::assert_matches!(next_message(&mut remote).await, Message::Publish(message) => {
            assert_eq!(message.request.value(), 1);
        });
        assert_matches::assert_matches!(peer.disconnect().await, Ok(()));
    }
}
