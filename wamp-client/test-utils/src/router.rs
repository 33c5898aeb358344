//! An in-memory WAMP router for tests.
//!
//! Speaks the basic profile over [`DirectMessageStream`]s: HELLO/WELCOME (or CHALLENGE, when
//! configured), GOODBYE in both directions, routed calls with cancellation, and publications with
//! exact, prefix, and wildcard matching.

use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
    PoisonError,
    atomic::{
        AtomicBool,
        AtomicU64,
        Ordering,
    },
};

use ahash::HashMap;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{
    SinkExt,
    StreamExt,
};
use log::{
    debug,
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
};
use wamp_client::{
    core::{
        close::CloseReason,
        error::{
            InteractionError,
            TransportError,
        },
        id::{
            Id,
            IdAllocator,
            RandomIdAllocator,
        },
        invocation_policy::InvocationPolicy,
        match_style::MatchStyle,
        stream::{
            DirectMessageStream,
            MessageStream,
            StreamMessage,
        },
        types::{
            Dictionary,
            Value,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::{
        common::{
            abort_message_for_error,
            error_message,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            CallMessage,
            ChallengeMessage,
            ErrorMessage,
            EventMessage,
            HelloMessage,
            InterruptMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            PublishedMessage,
            RegisterMessage,
            RegisteredMessage,
            ResultMessage,
            SubscribeMessage,
            SubscribedMessage,
            UnregisterMessage,
            UnregisteredMessage,
            UnsubscribeMessage,
            UnsubscribedMessage,
            WelcomeMessage,
        },
    },
    peer::{
        Connector,
        ConnectorFactory,
        PeerConfig,
    },
};

const PUBLISH: u64 = 16;
const SUBSCRIBE: u64 = 32;
const UNSUBSCRIBE: u64 = 34;
const CALL: u64 = 48;
const REGISTER: u64 = 64;
const UNREGISTER: u64 = 66;
const INVOCATION: u64 = 68;

/// Configuration for a [`LoopbackRouter`].
#[derive(Debug, Clone)]
pub struct LoopbackRouterConfig {
    pub realms: Vec<String>,
    /// Answers every HELLO with a CHALLENGE for this authentication method.
    pub challenge: Option<String>,
    /// Advertise and honor call canceling.
    pub call_canceling: bool,
}

impl Default for LoopbackRouterConfig {
    fn default() -> Self {
        Self {
            realms: Vec::from_iter(["realm1".to_owned()]),
            challenge: None,
            call_canceling: true,
        }
    }
}

fn dictionary<const N: usize>(entries: [(&str, Value); N]) -> Dictionary {
    Dictionary::from_iter(entries.map(|(key, value)| (key.to_owned(), value)))
}

fn features<const N: usize>(entries: [(&str, bool); N]) -> Value {
    Value::Dictionary(dictionary([(
        "features",
        Value::Dictionary(Dictionary::from_iter(
            entries.map(|(key, value)| (key.to_owned(), Value::Bool(value))),
        )),
    )]))
}

fn pattern_matches(pattern: &WildcardUri, match_style: MatchStyle, uri: &Uri) -> bool {
    match match_style {
        MatchStyle::Exact => pattern.as_str() == uri.as_str(),
        MatchStyle::Prefix => Uri::try_from(pattern).is_ok_and(|prefix| uri.has_prefix(&prefix)),
        MatchStyle::Wildcard => pattern.matches(uri),
    }
}

fn match_style_option(options: &Dictionary) -> MatchStyle {
    options
        .get("match")
        .and_then(Value::string)
        .and_then(|style| style.parse().ok())
        .unwrap_or_default()
}

struct JoinedSession {
    realm: String,
    /// The router sent GOODBYE, and waits for the reply.
    closing: bool,
}

struct Connection {
    message_tx: UnboundedSender<Message>,
    kill_tx: Option<oneshot::Sender<()>>,
    session: Option<JoinedSession>,
}

struct RouterRegistration {
    id: Id,
    realm: String,
    procedure: WildcardUri,
    match_style: MatchStyle,
    policy: InvocationPolicy,
    callees: Vec<u64>,
    next: usize,
}

struct RouterSubscription {
    id: Id,
    realm: String,
    topic: WildcardUri,
    match_style: MatchStyle,
    subscribers: Vec<u64>,
}

struct PendingInvocation {
    caller: u64,
    call_request: Id,
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<u64, Connection>,
    registrations: Vec<RouterRegistration>,
    subscriptions: Vec<RouterSubscription>,
    /// By callee connection and invocation request.
    invocations: HashMap<(u64, Id), PendingInvocation>,
}

impl RouterState {
    fn send(&self, connection: u64, message: Message) {
        if let Some(target) = self.connections.get(&connection) {
            trace!("Router sending {} to {connection}", message.message_name());
            target.message_tx.send(message).ok();
        }
    }

    fn realm(&self, connection: u64) -> Option<String> {
        self.connections
            .get(&connection)
            .and_then(|connection| connection.session.as_ref())
            .map(|session| session.realm.clone())
    }

    /// Removes every resource of the session on the connection.
    fn leave(&mut self, connection: u64) {
        if let Some(target) = self.connections.get_mut(&connection) {
            target.session = None;
        }
        for registration in &mut self.registrations {
            registration.callees.retain(|callee| *callee != connection);
        }
        self.registrations
            .retain(|registration| !registration.callees.is_empty());
        for subscription in &mut self.subscriptions {
            subscription
                .subscribers
                .retain(|subscriber| *subscriber != connection);
        }
        self.subscriptions
            .retain(|subscription| !subscription.subscribers.is_empty());

        let abandoned = self
            .invocations
            .keys()
            .filter(|(callee, _)| *callee == connection)
            .cloned()
            .collect::<Vec<_>>();
        for key in abandoned {
            if let Some(pending) = self.invocations.remove(&key) {
                self.send(
                    pending.caller,
                    error_message(
                        CALL,
                        pending.call_request,
                        &InteractionError::Canceled.into(),
                    ),
                );
            }
        }
        self.invocations
            .retain(|_, pending| pending.caller != connection);
    }
}

struct Shared {
    config: LoopbackRouterConfig,
    runtime: Handle,
    online: AtomicBool,
    refused_connections: AtomicU64,
    next_connection: AtomicU64,
    ids: RandomIdAllocator,
    state: Mutex<RouterState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept(self: &Arc<Self>) -> Box<dyn MessageStream> {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (client, server) = DirectMessageStream::pair();
        let (message_tx, message_rx) = unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        self.state().connections.insert(
            connection,
            Connection {
                message_tx,
                kill_tx: Some(kill_tx),
                session: None,
            },
        );
        self.runtime.spawn(
            self.clone()
                .connection_loop(connection, server, message_rx, kill_rx),
        );
        debug!("Router accepted connection {connection}");
        Box::new(client)
    }

    async fn connection_loop(
        self: Arc<Self>,
        connection: u64,
        mut stream: DirectMessageStream,
        mut message_rx: UnboundedReceiver<Message>,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(StreamMessage::Message(message))) => {
                            // Every message creates at most one new resource.
                            let id = self.ids.generate_id().await;
                            self.handle_message(connection, message, id);
                        }
                        Some(Ok(StreamMessage::Ping(_))) => (),
                        Some(Err(_)) | None => break,
                    }
                }
                message = message_rx.recv() => {
                    match message {
                        Some(message) => {
                            if stream.send(StreamMessage::Message(message)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = &mut kill_rx => break,
            }
        }
        debug!("Router closed connection {connection}");
        let mut state = self.state();
        state.leave(connection);
        state.connections.remove(&connection);
    }

    fn handle_message(&self, connection: u64, message: Message, id: Id) {
        trace!(
            "Router received {} from {connection}",
            message.message_name()
        );
        let mut state = self.state();
        if let Message::Hello(message) = message {
            self.hello(&mut state, connection, message, id);
            return;
        }
        let Some(realm) = state.realm(connection) else {
            // Without a session, only the end of a refused join is expected.
            return;
        };
        match message {
            Message::Goodbye(_) => {
                let closing = state
                    .connections
                    .get(&connection)
                    .and_then(|connection| connection.session.as_ref())
                    .is_some_and(|session| session.closing);
                if !closing {
                    state.send(connection, goodbye_and_out());
                }
                state.leave(connection);
            }
            Message::Abort(_) => state.leave(connection),
            Message::Register(message) => self.register(&mut state, connection, realm, message, id),
            Message::Unregister(message) => self.unregister(&mut state, connection, message),
            Message::Subscribe(message) => {
                self.subscribe(&mut state, connection, realm, message, id)
            }
            Message::Unsubscribe(message) => self.unsubscribe(&mut state, connection, message),
            Message::Publish(message) => self.publish(&mut state, connection, realm, message, id),
            Message::Call(message) => self.call(&mut state, connection, realm, message, id),
            Message::Cancel(message) => {
                let key = state
                    .invocations
                    .iter()
                    .find(|(_, pending)| {
                        pending.caller == connection && pending.call_request == message.call_request
                    })
                    .map(|(key, _)| *key);
                if let Some((callee, invocation_request)) = key {
                    state.invocations.remove(&(callee, invocation_request));
                    state.send(
                        connection,
                        error_message(
                            CALL,
                            message.call_request,
                            &InteractionError::Canceled.into(),
                        ),
                    );
                    state.send(
                        callee,
                        Message::Interrupt(InterruptMessage {
                            invocation_request,
                            options: message.options,
                        }),
                    );
                }
            }
            Message::Yield(message) => {
                if let Some(pending) = state
                    .invocations
                    .remove(&(connection, message.invocation_request))
                {
                    state.send(
                        pending.caller,
                        Message::Result(ResultMessage {
                            call_request: pending.call_request,
                            details: Dictionary::default(),
                            yield_arguments: message.arguments,
                            yield_arguments_keyword: message.arguments_keyword,
                        }),
                    );
                }
            }
            Message::Error(message) if message.request_type == INVOCATION => {
                if let Some(pending) = state.invocations.remove(&(connection, message.request)) {
                    state.send(
                        pending.caller,
                        Message::Error(ErrorMessage {
                            request_type: CALL,
                            request: pending.call_request,
                            ..message
                        }),
                    );
                }
            }
            message => debug!(
                "Router ignoring {} from {connection}",
                message.message_name()
            ),
        }
    }

    fn hello(&self, state: &mut RouterState, connection: u64, message: HelloMessage, id: Id) {
        if !self
            .config
            .realms
            .iter()
            .any(|realm| realm == message.realm.as_str())
        {
            state.send(
                connection,
                abort_message_for_error(&InteractionError::NoSuchRealm.into()),
            );
            return;
        }
        if let Some(auth_method) = &self.config.challenge {
            state.send(
                connection,
                Message::Challenge(ChallengeMessage {
                    auth_method: auth_method.clone(),
                    extra: Dictionary::default(),
                }),
            );
            return;
        }
        if let Some(target) = state.connections.get_mut(&connection) {
            target.session = Some(JoinedSession {
                realm: message.realm.as_str().to_owned(),
                closing: false,
            });
        }
        let details = dictionary([
            ("authid", Value::from(format!("client-{connection}"))),
            ("authrole", Value::from("anonymous")),
            ("authmethod", Value::from("anonymous")),
            (
                "roles",
                Value::Dictionary(dictionary([
                    (
                        "dealer",
                        features([("call_canceling", self.config.call_canceling)]),
                    ),
                    (
                        "broker",
                        features([
                            ("publisher_exclusion", true),
                            ("pattern_based_subscription", true),
                        ]),
                    ),
                ])),
            ),
        ]);
        state.send(
            connection,
            Message::Welcome(WelcomeMessage {
                session: id,
                details,
            }),
        );
    }

    fn register(
        &self,
        state: &mut RouterState,
        connection: u64,
        realm: String,
        message: RegisterMessage,
        id: Id,
    ) {
        let match_style = match_style_option(&message.options);
        let policy = message
            .options
            .get("invoke")
            .and_then(Value::string)
            .and_then(|policy| policy.parse().ok())
            .unwrap_or_default();
        let existing = state.registrations.iter_mut().find(|registration| {
            registration.realm == realm
                && registration.procedure == message.procedure
                && registration.match_style == match_style
        });
        let registration = match existing {
            Some(existing) => {
                if existing.policy == InvocationPolicy::Single
                    || existing.policy != policy
                    || existing.callees.contains(&connection)
                {
                    state.send(
                        connection,
                        error_message(
                            REGISTER,
                            message.request,
                            &InteractionError::ProcedureAlreadyExists.into(),
                        ),
                    );
                    return;
                }
                existing.callees.push(connection);
                existing.id
            }
            None => {
                state.registrations.push(RouterRegistration {
                    id,
                    realm,
                    procedure: message.procedure,
                    match_style,
                    policy,
                    callees: Vec::from_iter([connection]),
                    next: 0,
                });
                id
            }
        };
        state.send(
            connection,
            Message::Registered(RegisteredMessage {
                register_request: message.request,
                registration,
            }),
        );
    }

    fn unregister(&self, state: &mut RouterState, connection: u64, message: UnregisterMessage) {
        let found = state.registrations.iter_mut().any(|registration| {
            if registration.id != message.registered_registration
                || !registration.callees.contains(&connection)
            {
                return false;
            }
            registration.callees.retain(|callee| *callee != connection);
            true
        });
        state
            .registrations
            .retain(|registration| !registration.callees.is_empty());
        let reply = if found {
            Message::Unregistered(UnregisteredMessage {
                unregister_request: message.request,
            })
        } else {
            error_message(
                UNREGISTER,
                message.request,
                &InteractionError::NoSuchRegistration.into(),
            )
        };
        state.send(connection, reply);
    }

    fn subscribe(
        &self,
        state: &mut RouterState,
        connection: u64,
        realm: String,
        message: SubscribeMessage,
        id: Id,
    ) {
        let match_style = match_style_option(&message.options);
        let existing = state.subscriptions.iter_mut().find(|subscription| {
            subscription.realm == realm
                && subscription.topic == message.topic
                && subscription.match_style == match_style
        });
        let subscription = match existing {
            Some(existing) => {
                if !existing.subscribers.contains(&connection) {
                    existing.subscribers.push(connection);
                }
                existing.id
            }
            None => {
                state.subscriptions.push(RouterSubscription {
                    id,
                    realm,
                    topic: message.topic,
                    match_style,
                    subscribers: Vec::from_iter([connection]),
                });
                id
            }
        };
        state.send(
            connection,
            Message::Subscribed(SubscribedMessage {
                subscribe_request: message.request,
                subscription,
            }),
        );
    }

    fn unsubscribe(&self, state: &mut RouterState, connection: u64, message: UnsubscribeMessage) {
        let found = state.subscriptions.iter_mut().any(|subscription| {
            if subscription.id != message.subscribed_subscription
                || !subscription.subscribers.contains(&connection)
            {
                return false;
            }
            subscription
                .subscribers
                .retain(|subscriber| *subscriber != connection);
            true
        });
        state
            .subscriptions
            .retain(|subscription| !subscription.subscribers.is_empty());
        let reply = if found {
            Message::Unsubscribed(UnsubscribedMessage {
                unsubscribe_request: message.request,
            })
        } else {
            error_message(
                UNSUBSCRIBE,
                message.request,
                &InteractionError::NoSuchSubscription.into(),
            )
        };
        state.send(connection, reply);
    }

    fn publish(
        &self,
        state: &mut RouterState,
        connection: u64,
        realm: String,
        message: PublishMessage,
        id: Id,
    ) {
        let exclude_me = message
            .options
            .get("exclude_me")
            .and_then(Value::bool)
            .unwrap_or(true);
        let acknowledge = message
            .options
            .get("acknowledge")
            .and_then(Value::bool)
            .unwrap_or(false);

        let mut events = Vec::new();
        for subscription in &state.subscriptions {
            if subscription.realm != realm
                || !pattern_matches(&subscription.topic, subscription.match_style, &message.topic)
            {
                continue;
            }
            let mut details = Dictionary::default();
            if subscription.match_style != MatchStyle::Exact {
                details.insert(
                    "topic".to_owned(),
                    Value::from(message.topic.as_str()),
                );
            }
            for subscriber in &subscription.subscribers {
                if exclude_me && *subscriber == connection {
                    continue;
                }
                events.push((
                    *subscriber,
                    Message::Event(EventMessage {
                        subscribed_subscription: subscription.id,
                        published_publication: id,
                        details: details.clone(),
                        publish_arguments: message.arguments.clone(),
                        publish_arguments_keyword: message.arguments_keyword.clone(),
                    }),
                ));
            }
        }
        for (subscriber, event) in events {
            state.send(subscriber, event);
        }
        if acknowledge {
            state.send(
                connection,
                Message::Published(PublishedMessage {
                    publish_request: message.request,
                    publication: id,
                }),
            );
        }
    }

    fn call(
        &self,
        state: &mut RouterState,
        connection: u64,
        realm: String,
        message: CallMessage,
        id: Id,
    ) {
        let procedure = &message.procedure;
        let index = state
            .registrations
            .iter()
            .position(|registration| {
                registration.realm == realm
                    && registration.match_style == MatchStyle::Exact
                    && registration.procedure.as_str() == procedure.as_str()
            })
            .or_else(|| {
                state.registrations.iter().position(|registration| {
                    registration.realm == realm
                        && pattern_matches(&registration.procedure, registration.match_style, procedure)
                })
            });
        let Some(index) = index else {
            state.send(
                connection,
                error_message(
                    CALL,
                    message.request,
                    &InteractionError::NoSuchProcedure.into(),
                ),
            );
            return;
        };

        let registration = &mut state.registrations[index];
        let callees = registration.callees.len();
        let callee = match registration.policy {
            InvocationPolicy::Single | InvocationPolicy::First => registration.callees[0],
            InvocationPolicy::Last => registration.callees[callees - 1],
            InvocationPolicy::RoundRobin => {
                let callee = registration.callees[registration.next % callees];
                registration.next = registration.next.wrapping_add(1);
                callee
            }
            InvocationPolicy::Random => registration.callees[(id.value() as usize) % callees],
        };
        let mut details = Dictionary::default();
        if registration.match_style != MatchStyle::Exact {
            details.insert("procedure".to_owned(), Value::from(procedure.as_str()));
        }
        let invocation = Message::Invocation(InvocationMessage {
            request: id,
            registered_registration: registration.id,
            details,
            call_arguments: message.arguments,
            call_arguments_keyword: message.arguments_keyword,
        });
        state.invocations.insert(
            (callee, id),
            PendingInvocation {
                caller: connection,
                call_request: message.request,
            },
        );
        state.send(callee, invocation);
    }
}

struct LoopbackConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _: &PeerConfig, url: &str) -> Result<Box<dyn MessageStream>> {
        if !self.shared.online.load(Ordering::Acquire) {
            self.shared.refused_connections.fetch_add(1, Ordering::AcqRel);
            return Err(TransportError::new(format!("connection refused by {url}")).into());
        }
        Ok(self.shared.accept())
    }
}

struct LoopbackConnectorFactory {
    shared: Arc<Shared>,
}

impl ConnectorFactory for LoopbackConnectorFactory {
    fn new_connector(&self) -> Box<dyn Connector> {
        Box::new(LoopbackConnector {
            shared: self.shared.clone(),
        })
    }
}

/// An in-memory router, reachable through [`Self::connector_factory`] or
/// [`Self::direct_connect`].
#[derive(Clone)]
pub struct LoopbackRouter {
    shared: Arc<Shared>,
}

impl LoopbackRouter {
    /// Creates a router whose connections run on the runtime.
    pub fn new(config: LoopbackRouterConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                runtime,
                online: AtomicBool::new(true),
                refused_connections: AtomicU64::new(0),
                next_connection: AtomicU64::new(0),
                ids: RandomIdAllocator,
                state: Mutex::new(RouterState::default()),
            }),
        }
    }

    /// A connector factory for peers, which ignores the URL.
    pub fn connector_factory(&self) -> Box<dyn ConnectorFactory> {
        Box::new(LoopbackConnectorFactory {
            shared: self.shared.clone(),
        })
    }

    /// Opens a new connection.
    pub fn direct_connect(&self) -> Box<dyn MessageStream> {
        self.shared.accept()
    }

    /// Refuses new connections while offline.
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Release);
    }

    /// The number of connection attempts refused while offline.
    pub fn refused_connections(&self) -> u64 {
        self.shared.refused_connections.load(Ordering::Acquire)
    }

    /// Ends every joined session with a router-initiated GOODBYE.
    pub fn kick_all(&self, close_reason: CloseReason) {
        let mut state = self.shared.state();
        let mut kicked = Vec::new();
        for (id, connection) in &mut state.connections {
            if let Some(session) = connection.session.as_mut() {
                if !session.closing {
                    session.closing = true;
                    kicked.push(*id);
                }
            }
        }
        for connection in kicked {
            state.send(connection, goodbye_with_close_reason(close_reason));
        }
    }

    /// Drops every connection without a GOODBYE.
    pub fn drop_connections(&self) {
        let mut state = self.shared.state();
        for connection in state.connections.values_mut() {
            if let Some(kill_tx) = connection.kill_tx.take() {
                kill_tx.send(()).ok();
            }
        }
    }

    /// The number of open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.state().connections.len()
    }

    /// The number of joined sessions.
    pub fn session_count(&self) -> usize {
        self.shared
            .state()
            .connections
            .values()
            .filter(|connection| connection.session.is_some())
            .count()
    }

    /// The number of sessions that registered the procedure.
    pub fn callee_count(&self, procedure: &str) -> usize {
        self.shared
            .state()
            .registrations
            .iter()
            .filter(|registration| registration.procedure.as_str() == procedure)
            .map(|registration| registration.callees.len())
            .sum()
    }

    /// The number of sessions subscribed to the topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared
            .state()
            .subscriptions
            .iter()
            .filter(|subscription| subscription.topic.as_str() == topic)
            .map(|subscription| subscription.subscribers.len())
            .sum()
    }
}
