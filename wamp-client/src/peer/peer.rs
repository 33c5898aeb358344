use std::{
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use ahash::{
    HashMap,
    HashSet,
};
use anyhow::{
    Error,
    Result,
};
use futures_util::lock::Mutex;
use log::{
    debug,
    info,
    warn,
};
use tokio::{
    runtime::Handle,
    sync::{
        broadcast,
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        oneshot,
        watch,
    },
};

use crate::{
    core::{
        error::{
            CallTimeout,
            SessionClosed,
        },
        id::{
            Id,
            IdAllocator,
            SequentialIdAllocator,
        },
        invocation_policy::InvocationPolicy,
        match_style::MatchStyle,
        roles::{
            ALL_PEER_ROLES,
            PeerRole,
            roles_details,
        },
        service::{
            Service,
            ServiceHandle,
        },
        stream::MessageStream,
        types::{
            Dictionary,
            List,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::message::Message,
    peer::{
        connector::connector::ConnectorFactory,
        handler::{
            Procedure,
            Subscriber,
        },
        session::{
            Command,
            LeaveDetails,
            Session,
            SessionDetails,
            hello_details,
        },
        state::{
            SessionState,
            StateTracker,
        },
    },
    serializer::serializer::SerializerType,
};

const DEFAULT_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Configuration for WebSocket-specific WAMP connections.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConfig {
    /// Additional headers to include in the WebSocket handshake request.
    pub headers: HashMap<String, String>,
}

/// Configuration for a [`Peer`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name of the peer, mostly for logging.
    pub name: String,
    /// Agent name, communicated to the router.
    pub agent: String,
    /// Roles implemented by the peer.
    pub roles: HashSet<PeerRole>,
    /// Allowed serializers, in order of preference.
    ///
    /// The actual serializer is selected when the connection with the router is established.
    pub serializers: Vec<SerializerType>,
    /// Additional configuration for WebSocket-specific connections.
    pub web_socket: Option<WebSocketConfig>,
    /// How long a call may wait for its result, unless the call sets its own timeout.
    pub call_timeout: Option<Duration>,
    /// How long the connection may go without traffic before it is dropped.
    ///
    /// Off by default, since the router is not required to send anything to an idle session.
    pub idle_timeout: Option<Duration>,
    /// Opaque metadata about the application, handed to components as is.
    pub extra: Dictionary,
}

impl PeerConfig {
    fn validate(&self) -> Result<()> {
        if self.serializers.is_empty() {
            return Err(Error::msg("at least one serializer is required"));
        }
        if self.roles.is_empty() {
            return Err(Error::msg("at least one role is required"));
        }
        Ok(())
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_AGENT.to_owned(),
            agent: DEFAULT_AGENT.to_owned(),
            roles: HashSet::from_iter(ALL_PEER_ROLES),
            serializers: Vec::from_iter([SerializerType::Json, SerializerType::MessagePack]),
            web_socket: None,
            call_timeout: None,
            idle_timeout: None,
            extra: Dictionary::default(),
        }
    }
}

/// Options for registering a procedure.
#[derive(Debug, Default, Clone)]
pub struct ProcedureOptions {
    /// How the procedure should be matched for procedure calls.
    pub match_style: MatchStyle,
    /// How the router should select a callee when several sessions register the procedure.
    pub invocation_policy: InvocationPolicy,
}

/// Options for subscribing to a topic.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionOptions {
    /// How the subscription should be matched for published events.
    pub match_style: MatchStyle,
}

/// A procedure registered by this peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Registration ID, as given by the router.
    pub id: Id,
    pub procedure: WildcardUri,
    pub match_style: MatchStyle,
}

/// A subscription held by this peer.
///
/// Several subscriptions to the same topic share one router subscription, but are removed
/// independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Local handle.
    pub id: Id,
    /// Subscription ID, as given by the router.
    pub subscription: Id,
    pub topic: WildcardUri,
}

/// An RPC call.
#[derive(Debug, Default, Clone)]
pub struct RpcCall {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    /// Overrides [`PeerConfig::call_timeout`].
    pub timeout: Option<Duration>,
}

impl RpcCall {
    pub fn with_arguments(arguments: List) -> Self {
        Self {
            arguments,
            ..Default::default()
        }
    }
}

/// The result of an RPC call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RpcResult {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub details: Dictionary,
}

/// Options for publishing an event.
#[derive(Debug, Default, Clone)]
pub struct PublishOptions {
    /// Wait for the router to confirm the publication.
    pub acknowledge: bool,
    /// Do not deliver the event to subscriptions of this session.
    pub exclude_me: bool,
}

/// An event to publish.
#[derive(Debug, Default, Clone)]
pub struct PublishedEvent {
    pub arguments: List,
    pub arguments_keyword: Dictionary,
    pub options: PublishOptions,
}

impl PublishedEvent {
    pub fn with_arguments(arguments: List) -> Self {
        Self {
            arguments,
            ..Default::default()
        }
    }
}

struct PeerState {
    connection: u64,
    service: ServiceHandle,
    command_tx: UnboundedSender<Command>,
    /// Request IDs are scoped to the connection, which carries at most one session.
    id_allocator: Arc<SequentialIdAllocator>,
}

/// A WAMP peer (a.k.a., client) that connects to a WAMP router, establishes sessions in a realm,
/// and interacts with resources in the realm.
///
/// Every task of the peer runs on the runtime given at construction.
pub struct Peer {
    config: PeerConfig,
    connector_factory: Box<dyn ConnectorFactory>,
    runtime: Handle,

    state: StateTracker,
    details_tx: Arc<watch::Sender<Option<SessionDetails>>>,
    next_connection: AtomicU64,

    session_finished_tx: broadcast::Sender<LeaveDetails>,
    drop_tx: broadcast::Sender<()>,

    peer_state: Arc<Mutex<Option<PeerState>>>,
}

impl Peer {
    /// Creates a new peer.
    pub fn new(
        config: PeerConfig,
        connector_factory: Box<dyn ConnectorFactory>,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        let (details_tx, _) = watch::channel(None);
        let (session_finished_tx, _) = broadcast::channel(16);
        let (drop_tx, _) = broadcast::channel(1);
        Ok(Self {
            state: StateTracker::new(&config.name),
            config,
            connector_factory,
            runtime,
            details_tx: Arc::new(details_tx),
            next_connection: AtomicU64::new(0),
            session_finished_tx,
            drop_tx,
            peer_state: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// The runtime the peer spawns its tasks on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// The current state of the session lifecycle.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Receiver for every change of the session lifecycle.
    pub fn state_rx(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The active session, if joined.
    pub fn current_session(&self) -> Option<SessionDetails> {
        self.details_tx.borrow().clone()
    }

    /// Receiver for joined sessions ending, for reconnection logic.
    pub fn session_finished_rx(&self) -> broadcast::Receiver<LeaveDetails> {
        self.session_finished_tx.subscribe()
    }

    /// Connects to a router.
    ///
    /// This method merely establishes a network connection with the router. It does not establish
    /// any WAMP session. Any previous connection is closed first.
    ///
    /// The connection is maintained asynchronously. If the peer loses connection to the router,
    /// methods depending on the connection fail until the peer connects again.
    pub async fn connect(&self, url: &str) -> Result<()> {
        self.disconnect().await?;
        self.state.transition(SessionState::Connecting)?;
        let connector = self.connector_factory.new_connector();
        let stream = match connector.connect(&self.config, url).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(
                    "Peer {} failed to connect to {url}: {err:#}",
                    self.config.name
                );
                self.state.transition(SessionState::Disconnected)?;
                return Err(err);
            }
        };
        info!(
            "WAMP connection established with {url} for peer {}",
            self.config.name
        );
        self.start_connection(stream).await
    }

    /// Directly connects to a router with the given message stream.
    pub async fn direct_connect(&self, stream: Box<dyn MessageStream>) -> Result<()> {
        self.disconnect().await?;
        self.state.transition(SessionState::Connecting)?;
        self.start_connection(stream).await
    }

    async fn start_connection(&self, stream: Box<dyn MessageStream>) -> Result<()> {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}#{connection}", self.config.name);
        let (service, service_message_rx) = Service::start(
            name.clone(),
            stream,
            self.config.idle_timeout,
            &self.runtime,
        );
        let (command_tx, command_rx) = unbounded_channel();
        let session = Session::new(
            name,
            self.state.clone(),
            self.details_tx.clone(),
            service.message_tx(),
            command_tx.clone(),
            self.runtime.clone(),
        );

        *self.peer_state.lock().await = Some(PeerState {
            connection,
            service,
            command_tx,
            id_allocator: Arc::new(SequentialIdAllocator::default()),
        });

        self.runtime.spawn(Self::message_handler(
            session,
            connection,
            self.peer_state.clone(),
            self.session_finished_tx.clone(),
            command_rx,
            service_message_rx,
            self.drop_tx.subscribe(),
        ));
        Ok(())
    }

    async fn message_handler(
        mut session: Session,
        connection: u64,
        peer_state: Arc<Mutex<Option<PeerState>>>,
        session_finished_tx: broadcast::Sender<LeaveDetails>,
        mut command_rx: UnboundedReceiver<Command>,
        mut service_message_rx: UnboundedReceiver<Message>,
        mut drop_rx: broadcast::Receiver<()>,
    ) {
        while !session.ended() {
            tokio::select! {
                // Received a command from the peer object or the dispatcher.
                command = command_rx.recv() => {
                    match command {
                        Some(command) => session.handle_command(command),
                        None => session.transport_lost(),
                    }
                }
                // Received a message from the router.
                message = service_message_rx.recv() => {
                    match message {
                        Some(message) => {
                            let message_name = message.message_name();
                            if let Err(err) = session.handle_message(message) {
                                session.abort(&err.context(format!("failed to handle {message_name} message")));
                            }
                        }
                        None => session.transport_lost(),
                    }
                }
                // Peer was dropped.
                _ = drop_rx.recv() => {
                    debug!("Peer {} dropped with an active connection", session.name());
                    session.transport_lost();
                }
            }
        }

        // The connection may already be replaced by a newer one.
        let current = {
            let mut peer_state = peer_state.lock().await;
            match peer_state.as_ref() {
                Some(state) if state.connection == connection => peer_state.take(),
                _ => None,
            }
        };
        if let Some(mut state) = current {
            state.service.cancel();
            if let Err(err) = state.service.join().await {
                warn!("Service of {} did not finish cleanly: {err:#}", session.name());
            }
        }

        info!("Peer session {} finished", session.name());
        if let Some(details) = session.take_leave_details() {
            session_finished_tx.send(details).ok();
        }
    }

    async fn connection(&self) -> Result<(UnboundedSender<Command>, Arc<SequentialIdAllocator>)> {
        match self.peer_state.lock().await.as_ref() {
            Some(state) => Ok((state.command_tx.clone(), state.id_allocator.clone())),
            None => Err(SessionClosed.into()),
        }
    }

    async fn request<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let (command_tx, _) = self.connection().await?;
        let (result_tx, result_rx) = oneshot::channel();
        command_tx
            .send(command(result_tx))
            .map_err(|_| SessionClosed)?;
        result_rx.await.map_err(|_| SessionClosed)?
    }

    /// Like [`Self::request`], for requests the router answers by request ID.
    async fn request_with_id<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(Id, oneshot::Sender<Result<T>>) -> Command,
    {
        let (command_tx, id_allocator) = self.connection().await?;
        let request = id_allocator.generate_id().await;
        let (result_tx, result_rx) = oneshot::channel();
        command_tx
            .send(command(request, result_tx))
            .map_err(|_| SessionClosed)?;
        result_rx.await.map_err(|_| SessionClosed)?
    }

    /// Joins a realm, establishing a WAMP session.
    ///
    /// Any authentication challenge from the router is refused.
    pub async fn join_realm(&self, realm: &str) -> Result<SessionDetails> {
        let realm = Uri::try_from(realm)?;
        let details = hello_details(&self.config.agent, roles_details(&self.config.roles));
        self.request(|result_tx| Command::Join {
            realm,
            details,
            result_tx,
        })
        .await
    }

    /// Leaves the realm, closing the WAMP session.
    ///
    /// Registrations, subscriptions, and pending requests of the session are invalidated
    /// immediately. Resolves when the router confirms.
    pub async fn leave_realm(&self) -> Result<LeaveDetails> {
        self.request(|result_tx| Command::Leave { result_tx }).await
    }

    /// Disconnects from the router.
    pub async fn disconnect(&self) -> Result<()> {
        let state = self.peer_state.lock().await.take();
        if let Some(mut state) = state {
            info!(
                "Peer {} was instructed to disconnect from the router",
                self.config.name
            );
            state.service.cancel();
            state.service.join().await?;
        }
        self.state
            .wait_for(|state| *state == SessionState::Disconnected)
            .await;
        Ok(())
    }

    /// Registers a procedure that other sessions can call.
    pub async fn register(
        &self,
        procedure: &str,
        handler: Arc<dyn Procedure>,
        options: ProcedureOptions,
    ) -> Result<Registration> {
        let procedure = Self::pattern(procedure, options.match_style)?;
        self.request_with_id(|request, result_tx| Command::Register {
            request,
            procedure,
            options,
            handler,
            result_tx,
        })
        .await
    }

    /// Unregisters a procedure.
    pub async fn unregister(&self, registration: &Registration) -> Result<()> {
        let registration = registration.id;
        self.request_with_id(|request, result_tx| Command::Unregister {
            request,
            registration,
            result_tx,
        })
        .await
    }

    /// Subscribes to a topic.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn Subscriber>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let topic = Self::pattern(topic, options.match_style)?;
        self.request_with_id(|request, result_tx| Command::Subscribe {
            request,
            topic,
            options,
            handler,
            result_tx,
        })
        .await
    }

    /// Removes a subscription.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        let subscription = subscription.clone();
        self.request_with_id(|request, result_tx| Command::Unsubscribe {
            request,
            subscription,
            result_tx,
        })
        .await
    }

    /// Calls a procedure and waits for its result.
    ///
    /// On timeout, the call is abandoned with [`CallTimeout`], and canceled at the router if the
    /// router supports it.
    pub async fn call(&self, procedure: &str, call: RpcCall) -> Result<RpcResult> {
        let procedure = Uri::try_from(procedure)?;
        let (command_tx, id_allocator) = self.connection().await?;
        let request = id_allocator.generate_id().await;
        let timeout = call.timeout.or(self.config.call_timeout);
        let (result_tx, result_rx) = oneshot::channel();
        command_tx
            .send(Command::Call {
                request,
                procedure,
                call,
                result_tx,
            })
            .map_err(|_| SessionClosed)?;
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, result_rx).await {
                Ok(result) => result,
                Err(_) => {
                    command_tx.send(Command::CancelCall { request }).ok();
                    return Err(CallTimeout.into());
                }
            },
            None => result_rx.await,
        };
        result.map_err(|_| SessionClosed)?
    }

    /// Publishes an event to a topic.
    pub async fn publish(&self, topic: &str, event: PublishedEvent) -> Result<()> {
        let topic = Uri::try_from(topic)?;
        self.request_with_id(|request, result_tx| Command::Publish {
            request,
            topic,
            event,
            result_tx,
        })
        .await
    }

    fn pattern(uri: &str, match_style: MatchStyle) -> Result<WildcardUri> {
        match match_style {
            MatchStyle::Wildcard => Ok(WildcardUri::try_from(uri)?),
            MatchStyle::Exact | MatchStyle::Prefix => Ok(WildcardUri::from(Uri::try_from(uri)?)),
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.drop_tx.send(()).ok();
    }
}
