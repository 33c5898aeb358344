use std::sync::Arc;

use ahash::{
    HashMap,
    HashSet,
};
use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    info,
    trace,
    warn,
};
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::UnboundedSender,
        oneshot,
        watch,
    },
};

use crate::{
    core::{
        close::CloseReason,
        error::{
            AuthenticationRefused,
            BasicError,
            InteractionError,
            SessionClosed,
            TransportError,
            error_from_error_payload,
            error_from_uri_reason_and_message,
            error_message_text,
        },
        id::Id,
        match_style::MatchStyle,
        types::{
            Dictionary,
            List,
            Value,
            lookup,
        },
        uri::{
            Uri,
            WildcardUri,
        },
    },
    message::{
        common::{
            abort_message_for_error,
            abort_message_for_reason,
            error_message,
            goodbye_and_out,
            goodbye_with_close_reason,
        },
        message::{
            AbortMessage,
            CallMessage,
            CancelMessage,
            ChallengeMessage,
            ErrorMessage,
            EventMessage,
            GoodbyeMessage,
            HelloMessage,
            InvocationMessage,
            Message,
            PublishMessage,
            RegisterMessage,
            SubscribeMessage,
            UnregisterMessage,
            UnsubscribeMessage,
            WelcomeMessage,
            YieldMessage,
        },
    },
    peer::{
        dispatcher::{
            Dispatch,
            Dispatcher,
        },
        handler::{
            Invocation,
            Procedure,
            ReceivedEvent,
            RpcYield,
            Subscriber,
        },
        peer::{
            ProcedureOptions,
            PublishedEvent,
            Registration,
            RpcCall,
            RpcResult,
            Subscription,
            SubscriptionOptions,
        },
        state::{
            SessionState,
            StateTracker,
        },
    },
};

const PUBLISH: u64 = 16;
const SUBSCRIBE: u64 = 32;
const UNSUBSCRIBE: u64 = 34;
const CALL: u64 = 48;
const REGISTER: u64 = 64;
const UNREGISTER: u64 = 66;
const INVOCATION: u64 = 68;

/// An established session, as described by the router's WELCOME.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionDetails {
    pub session: Id,
    pub realm: Uri,
    pub authid: String,
    pub authrole: String,
    pub authmethod: String,
    /// Roles and features the router announced.
    pub roles: Dictionary,
}

impl SessionDetails {
    fn from_welcome(realm: Uri, message: WelcomeMessage) -> Self {
        let string = |key: &str| {
            message
                .details
                .get(key)
                .and_then(Value::string)
                .unwrap_or_default()
                .to_owned()
        };
        Self {
            session: message.session,
            realm,
            authid: string("authid"),
            authrole: string("authrole"),
            authmethod: string("authmethod"),
            roles: message
                .details
                .get("roles")
                .and_then(Value::dictionary)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Checks if the router announced an advanced feature for one of its roles.
    pub fn router_supports(&self, role: &str, feature: &str) -> bool {
        lookup(&self.roles, &[role, "features", feature]) == Some(&Value::Bool(true))
    }
}

/// How a session ended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LeaveDetails {
    pub reason: Uri,
    pub message: String,
}

impl LeaveDetails {
    fn new(reason: Uri, details: &Dictionary) -> Self {
        Self {
            reason,
            message: error_message_text(details, &List::default()),
        }
    }

    fn transport_lost() -> Self {
        Self {
            reason: CloseReason::TransportLost.uri(),
            message: "connection to router lost".to_owned(),
        }
    }
}

/// A request from the peer API, or the dispatcher, to the session actor.
pub(crate) enum Command {
    Join {
        realm: Uri,
        details: Dictionary,
        result_tx: oneshot::Sender<Result<SessionDetails>>,
    },
    Leave {
        result_tx: oneshot::Sender<Result<LeaveDetails>>,
    },
    Register {
        request: Id,
        procedure: WildcardUri,
        options: ProcedureOptions,
        handler: Arc<dyn Procedure>,
        result_tx: oneshot::Sender<Result<Registration>>,
    },
    Unregister {
        request: Id,
        registration: Id,
        result_tx: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        request: Id,
        topic: WildcardUri,
        options: SubscriptionOptions,
        handler: Arc<dyn Subscriber>,
        result_tx: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        request: Id,
        subscription: Subscription,
        result_tx: oneshot::Sender<Result<()>>,
    },
    Call {
        request: Id,
        procedure: Uri,
        call: RpcCall,
        result_tx: oneshot::Sender<Result<RpcResult>>,
    },
    /// The caller stopped waiting for the call.
    CancelCall { request: Id },
    Publish {
        request: Id,
        topic: Uri,
        event: PublishedEvent,
        result_tx: oneshot::Sender<Result<()>>,
    },
    /// A procedure handler finished.
    Yield {
        request: Id,
        result: Result<RpcYield>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::Register { .. } => "Register",
            Self::Unregister { .. } => "Unregister",
            Self::Subscribe { .. } => "Subscribe",
            Self::Unsubscribe { .. } => "Unsubscribe",
            Self::Call { .. } => "Call",
            Self::CancelCall { .. } => "CancelCall",
            Self::Publish { .. } => "Publish",
            Self::Yield { .. } => "Yield",
        };
        f.debug_struct(name).finish_non_exhaustive()
    }
}

struct RegisteredProcedure {
    procedure: WildcardUri,
    match_style: MatchStyle,
    handler: Arc<dyn Procedure>,
}

struct TopicSubscription {
    topic: WildcardUri,
    /// Local handlers, by subscription handle.
    handlers: Vec<(Id, Arc<dyn Subscriber>)>,
}

struct PendingRegister {
    procedure: WildcardUri,
    match_style: MatchStyle,
    handler: Arc<dyn Procedure>,
    result_tx: oneshot::Sender<Result<Registration>>,
}

struct PendingSubscribe {
    topic: WildcardUri,
    handler: Arc<dyn Subscriber>,
    result_tx: oneshot::Sender<Result<Subscription>>,
}

/// Everything that lives only while the session is joined.
///
/// Dropped as a whole when the session leaves the joined state: the dispatcher stops, and every
/// pending request observes its closed channel as [`SessionClosed`].
struct JoinedSession {
    details: SessionDetails,
    dispatcher: Dispatcher,
    registrations: HashMap<Id, RegisteredProcedure>,
    subscriptions: HashMap<Id, TopicSubscription>,
    active_invocations: HashSet<Id>,
    pending_registers: HashMap<Id, PendingRegister>,
    pending_unregisters: HashMap<Id, oneshot::Sender<Result<()>>>,
    pending_subscribes: HashMap<Id, PendingSubscribe>,
    pending_unsubscribes: HashMap<Id, oneshot::Sender<Result<()>>>,
    pending_calls: HashMap<Id, oneshot::Sender<Result<RpcResult>>>,
    pending_publishes: HashMap<Id, oneshot::Sender<Result<()>>>,
}

impl JoinedSession {
    fn new(details: SessionDetails, dispatcher: Dispatcher) -> Self {
        Self {
            details,
            dispatcher,
            registrations: HashMap::default(),
            subscriptions: HashMap::default(),
            active_invocations: HashSet::default(),
            pending_registers: HashMap::default(),
            pending_unregisters: HashMap::default(),
            pending_subscribes: HashMap::default(),
            pending_unsubscribes: HashMap::default(),
            pending_calls: HashMap::default(),
            pending_publishes: HashMap::default(),
        }
    }

    /// A procedure may be registered once per match style.
    fn procedure_taken(&self, procedure: &WildcardUri, match_style: MatchStyle) -> bool {
        self.registrations.values().any(|registration| {
            &registration.procedure == procedure && registration.match_style == match_style
        }) || self
            .pending_registers
            .values()
            .any(|pending| &pending.procedure == procedure && pending.match_style == match_style)
    }
}

/// The session state machine of one connection.
///
/// Runs as a single actor: commands from the peer API and messages from the router are handled
/// one at a time, so no state is shared with application tasks.
pub(crate) struct Session {
    name: String,
    state: StateTracker,
    details_tx: Arc<watch::Sender<Option<SessionDetails>>>,
    service_tx: UnboundedSender<Message>,
    command_tx: UnboundedSender<Command>,
    runtime: Handle,

    realm: Option<Uri>,
    joined: Option<JoinedSession>,
    pending_join: Option<oneshot::Sender<Result<SessionDetails>>>,
    pending_leave: Option<oneshot::Sender<Result<LeaveDetails>>>,
    leave_details: Option<LeaveDetails>,
    ended: bool,
}

impl Session {
    pub fn new(
        name: String,
        state: StateTracker,
        details_tx: Arc<watch::Sender<Option<SessionDetails>>>,
        service_tx: UnboundedSender<Message>,
        command_tx: UnboundedSender<Command>,
        runtime: Handle,
    ) -> Self {
        Self {
            name,
            state,
            details_tx,
            service_tx,
            command_tx,
            runtime,
            realm: None,
            joined: None,
            pending_join: None,
            pending_leave: None,
            leave_details: None,
            ended: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the session reached the end of its lifecycle.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// How the session ended, if it was ever joined.
    pub fn take_leave_details(&mut self) -> Option<LeaveDetails> {
        self.leave_details.take()
    }

    fn send(&self, message: Message) -> Result<()> {
        self.service_tx
            .send(message)
            .map_err(|_| TransportError::new("connection closed").into())
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        self.state.transition(next)?;
        if next == SessionState::Disconnected {
            self.ended = true;
            self.details_tx.send_replace(None);
        }
        Ok(())
    }

    /// Leaves the joined state, invalidating registrations, subscriptions, and pending requests
    /// together.
    fn drop_joined(&mut self) {
        if let Some(joined) = self.joined.take() {
            debug!(
                "Peer {} dropping {} registration(s), {} subscription(s), and {} pending call(s) of session {}",
                self.name,
                joined.registrations.len(),
                joined.subscriptions.len(),
                joined.pending_calls.len(),
                joined.details.session,
            );
        }
        self.details_tx.send_replace(None);
    }

    pub fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join {
                realm,
                details,
                result_tx,
            } => {
                if let Err(err) = self.join(realm, details, result_tx) {
                    warn!("Peer {} failed to send HELLO: {err:#}", self.name);
                }
            }
            Command::Leave { result_tx } => match self.leave() {
                Ok(()) => self.pending_leave = Some(result_tx),
                Err(err) => {
                    result_tx.send(Err(err)).ok();
                }
            },
            Command::Yield { request, result } => self.finish_invocation(request, result),
            Command::CancelCall { request } => self.cancel_call(request),
            command => self.handle_joined_command(command),
        }
    }

    fn join(
        &mut self,
        realm: Uri,
        details: Dictionary,
        result_tx: oneshot::Sender<Result<SessionDetails>>,
    ) -> Result<()> {
        match self.state.get() {
            SessionState::Connecting => (),
            SessionState::Joined => {
                result_tx
                    .send(Err(BasicError::NotAllowed("session already joined".to_owned()).into()))
                    .ok();
                return Ok(());
            }
            SessionState::Joining | SessionState::Challenging => {
                result_tx
                    .send(Err(
                        BasicError::NotAllowed("join already in progress".to_owned()).into()
                    ))
                    .ok();
                return Ok(());
            }
            SessionState::Leaving | SessionState::Disconnected => {
                result_tx.send(Err(SessionClosed.into())).ok();
                return Ok(());
            }
        }
        info!("Peer {} joining realm {realm}", self.name);
        self.realm = Some(realm.clone());
        self.pending_join = Some(result_tx);
        self.transition(SessionState::Joining)?;
        self.send(Message::Hello(HelloMessage { realm, details }))
    }

    fn leave(&mut self) -> Result<()> {
        if self.state.get() != SessionState::Joined {
            return Err(SessionClosed.into());
        }
        info!("Peer {} leaving realm", self.name);
        self.drop_joined();
        self.transition(SessionState::Leaving)?;
        self.send(goodbye_with_close_reason(CloseReason::Normal))
    }

    fn cancel_call(&mut self, request: Id) {
        let Some(joined) = self.joined.as_mut() else {
            return;
        };
        if joined.pending_calls.remove(&request).is_none() {
            return;
        }
        if !joined.details.router_supports("dealer", "call_canceling") {
            debug!(
                "Peer {} abandoned call {request} without CANCEL, since the router does not support call canceling",
                self.name
            );
            return;
        }
        let cancel = Message::Cancel(CancelMessage {
            call_request: request,
            options: Dictionary::from_iter([("mode".to_owned(), Value::from("killnowait"))]),
        });
        if let Err(err) = self.send(cancel) {
            warn!("Peer {} failed to cancel call {request}: {err:#}", self.name);
        }
    }

    fn finish_invocation(&mut self, request: Id, result: Result<RpcYield>) {
        let Some(joined) = self.joined.as_mut() else {
            trace!(
                "Peer {} dropping result of invocation {request} for a closed session",
                self.name
            );
            return;
        };
        if !joined.active_invocations.remove(&request) {
            trace!(
                "Peer {} dropping result of interrupted invocation {request}",
                self.name
            );
            return;
        }
        let message = match result {
            Ok(output) => Message::Yield(YieldMessage {
                invocation_request: request,
                options: Dictionary::default(),
                arguments: output.arguments,
                arguments_keyword: output.arguments_keyword,
            }),
            Err(err) => {
                debug!(
                    "Peer {} procedure for invocation {request} failed: {err:#}",
                    self.name
                );
                error_message(INVOCATION, request, &err)
            }
        };
        if let Err(err) = self.send(message) {
            warn!(
                "Peer {} failed to answer invocation {request}: {err:#}",
                self.name
            );
        }
    }

    fn handle_joined_command(&mut self, command: Command) {
        let Some(joined) = self.joined.as_mut() else {
            Self::reject_closed(command);
            return;
        };
        let message = match command {
            Command::Register {
                request,
                procedure,
                options,
                handler,
                result_tx,
            } => {
                if joined.procedure_taken(&procedure, options.match_style) {
                    result_tx
                        .send(Err(InteractionError::ProcedureAlreadyExists.into()))
                        .ok();
                    return;
                }
                let mut message_options = Dictionary::default();
                if options.match_style != MatchStyle::Exact {
                    message_options.insert(
                        "match".to_owned(),
                        Value::from(options.match_style.as_str()),
                    );
                }
                message_options.insert(
                    "invoke".to_owned(),
                    Value::from(options.invocation_policy.as_str()),
                );
                joined.pending_registers.insert(
                    request,
                    PendingRegister {
                        procedure: procedure.clone(),
                        match_style: options.match_style,
                        handler,
                        result_tx,
                    },
                );
                Message::Register(RegisterMessage {
                    request,
                    options: message_options,
                    procedure,
                })
            }
            Command::Unregister {
                request,
                registration,
                result_tx,
            } => {
                if joined.registrations.remove(&registration).is_none() {
                    result_tx
                        .send(Err(InteractionError::NoSuchRegistration.into()))
                        .ok();
                    return;
                }
                joined.pending_unregisters.insert(request, result_tx);
                Message::Unregister(UnregisterMessage {
                    request,
                    registered_registration: registration,
                })
            }
            Command::Subscribe {
                request,
                topic,
                options,
                handler,
                result_tx,
            } => {
                let mut message_options = Dictionary::default();
                if options.match_style != MatchStyle::Exact {
                    message_options.insert(
                        "match".to_owned(),
                        Value::from(options.match_style.as_str()),
                    );
                }
                joined.pending_subscribes.insert(
                    request,
                    PendingSubscribe {
                        topic: topic.clone(),
                        handler,
                        result_tx,
                    },
                );
                Message::Subscribe(SubscribeMessage {
                    request,
                    options: message_options,
                    topic,
                })
            }
            Command::Unsubscribe {
                request,
                subscription,
                result_tx,
            } => {
                let Some(topic_subscription) =
                    joined.subscriptions.get_mut(&subscription.subscription)
                else {
                    result_tx
                        .send(Err(InteractionError::NoSuchSubscription.into()))
                        .ok();
                    return;
                };
                let before = topic_subscription.handlers.len();
                topic_subscription
                    .handlers
                    .retain(|(id, _)| *id != subscription.id);
                if topic_subscription.handlers.len() == before {
                    result_tx
                        .send(Err(InteractionError::NoSuchSubscription.into()))
                        .ok();
                    return;
                }
                if !topic_subscription.handlers.is_empty() {
                    // Other local handlers still need the router-side subscription.
                    result_tx.send(Ok(())).ok();
                    return;
                }
                joined.subscriptions.remove(&subscription.subscription);
                joined.pending_unsubscribes.insert(request, result_tx);
                Message::Unsubscribe(UnsubscribeMessage {
                    request,
                    subscribed_subscription: subscription.subscription,
                })
            }
            Command::Call {
                request,
                procedure,
                call,
                result_tx,
            } => {
                joined.pending_calls.insert(request, result_tx);
                Message::Call(CallMessage {
                    request,
                    options: Dictionary::default(),
                    procedure,
                    arguments: call.arguments,
                    arguments_keyword: call.arguments_keyword,
                })
            }
            Command::Publish {
                request,
                topic,
                event,
                result_tx,
            } => {
                let mut options = Dictionary::from_iter([(
                    "exclude_me".to_owned(),
                    Value::Bool(event.options.exclude_me),
                )]);
                if event.options.acknowledge {
                    options.insert("acknowledge".to_owned(), Value::Bool(true));
                    joined.pending_publishes.insert(request, result_tx);
                } else {
                    result_tx.send(Ok(())).ok();
                }
                Message::Publish(PublishMessage {
                    request,
                    options,
                    topic,
                    arguments: event.arguments,
                    arguments_keyword: event.arguments_keyword,
                })
            }
            Command::Join { .. }
            | Command::Leave { .. }
            | Command::CancelCall { .. }
            | Command::Yield { .. } => return,
        };
        trace!("Peer {} sending {}", self.name, message.message_name());
        if let Err(err) = self.send(message) {
            warn!("Peer {} failed to send request: {err:#}", self.name);
        }
    }

    fn reject_closed(command: Command) {
        match command {
            Command::Register { result_tx, .. } => {
                result_tx.send(Err(SessionClosed.into())).ok();
            }
            Command::Subscribe { result_tx, .. } => {
                result_tx.send(Err(SessionClosed.into())).ok();
            }
            Command::Call { result_tx, .. } => {
                result_tx.send(Err(SessionClosed.into())).ok();
            }
            Command::Unregister { result_tx, .. }
            | Command::Unsubscribe { result_tx, .. }
            | Command::Publish { result_tx, .. } => {
                result_tx.send(Err(SessionClosed.into())).ok();
            }
            Command::Join { .. }
            | Command::Leave { .. }
            | Command::CancelCall { .. }
            | Command::Yield { .. } => (),
        }
    }

    /// Handles a message from the router.
    ///
    /// An error means the router violated the protocol; the caller should [`Self::abort`] the
    /// session.
    pub fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!("Peer {} received {}", self.name, message.message_name());
        match self.state.get() {
            SessionState::Joining | SessionState::Challenging => self.handle_joining(message),
            SessionState::Joined => self.handle_joined(message),
            SessionState::Leaving => self.handle_leaving(message),
            SessionState::Connecting | SessionState::Disconnected => {
                Err(InteractionError::ProtocolViolation(format!(
                    "received {} message without a session",
                    message.message_name()
                ))
                .into())
            }
        }
    }

    fn handle_joining(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Welcome(message) => {
                let realm = self.realm.clone().unwrap_or_default();
                let details = SessionDetails::from_welcome(realm, message);
                self.transition(SessionState::Joined)?;
                info!(
                    "Peer {} joined realm {} as session {} (authid {:?}, authrole {:?})",
                    self.name, details.realm, details.session, details.authid, details.authrole
                );
                let dispatcher = Dispatcher::start(
                    self.name.clone(),
                    self.runtime.clone(),
                    self.command_tx.clone(),
                );
                self.joined = Some(JoinedSession::new(details.clone(), dispatcher));
                self.details_tx.send_replace(Some(details.clone()));
                if let Some(result_tx) = self.pending_join.take() {
                    result_tx.send(Ok(details)).ok();
                }
                Ok(())
            }
            Message::Challenge(message) => self.refuse_challenge(message),
            Message::Abort(message) => {
                warn!(
                    "Peer {} join aborted by router: {}",
                    self.name, message.reason
                );
                let err = Self::abort_error(&message);
                self.transition(SessionState::Disconnected)?;
                if let Some(result_tx) = self.pending_join.take() {
                    result_tx.send(Err(err)).ok();
                }
                Ok(())
            }
            message => Err(InteractionError::ProtocolViolation(format!(
                "received {} message while joining",
                message.message_name()
            ))
            .into()),
        }
    }

    fn refuse_challenge(&mut self, message: ChallengeMessage) -> Result<()> {
        self.transition(SessionState::Challenging)?;
        warn!(
            "Peer {} refusing {:?} authentication challenge",
            self.name, message.auth_method
        );
        // The connection is torn down right after, so a failed send changes nothing.
        self.send(abort_message_for_reason(
            Uri::from_known("wamp.error.cannot_authenticate"),
            "authentication is not supported",
        ))
        .ok();
        self.transition(SessionState::Disconnected)?;
        if let Some(result_tx) = self.pending_join.take() {
            result_tx
                .send(Err(AuthenticationRefused {
                    auth_method: message.auth_method,
                }
                .into()))
                .ok();
        }
        Ok(())
    }

    fn abort_error(message: &AbortMessage) -> Error {
        error_from_uri_reason_and_message(
            message.reason.clone(),
            error_message_text(&message.details, &message.arguments),
        )
    }

    fn handle_joined(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(message) => self.handle_router_goodbye(message),
            Message::Abort(message) => {
                warn!(
                    "Peer {} session aborted by router: {}",
                    self.name, message.reason
                );
                self.drop_joined();
                self.leave_details = Some(LeaveDetails::new(message.reason, &message.details));
                self.transition(SessionState::Disconnected)
            }
            Message::Invocation(message) => self.handle_invocation(message),
            Message::Interrupt(message) => {
                let request = message.invocation_request;
                let active = self
                    .joined
                    .as_mut()
                    .is_some_and(|joined| joined.active_invocations.remove(&request));
                if active {
                    debug!("Peer {} invocation {request} interrupted", self.name);
                    self.send(error_message(
                        INVOCATION,
                        request,
                        &InteractionError::Canceled.into(),
                    ))?;
                }
                Ok(())
            }
            Message::Event(message) => {
                self.handle_event(message);
                Ok(())
            }
            Message::Result(message) => {
                let pending = self
                    .joined
                    .as_mut()
                    .and_then(|joined| joined.pending_calls.remove(&message.call_request));
                match pending {
                    Some(result_tx) => {
                        result_tx
                            .send(Ok(RpcResult {
                                arguments: message.yield_arguments,
                                arguments_keyword: message.yield_arguments_keyword,
                                details: message.details,
                            }))
                            .ok();
                    }
                    None => trace!(
                        "Peer {} ignoring RESULT for abandoned call {}",
                        self.name, message.call_request
                    ),
                }
                Ok(())
            }
            Message::Error(message) => {
                self.handle_error(message);
                Ok(())
            }
            Message::Registered(message) => {
                if let Some(joined) = self.joined.as_mut() {
                    if let Some(pending) = joined.pending_registers.remove(&message.register_request)
                    {
                        debug!(
                            "Peer {} registered {} as {}",
                            self.name, pending.procedure, message.registration
                        );
                        joined.registrations.insert(
                            message.registration,
                            RegisteredProcedure {
                                procedure: pending.procedure.clone(),
                                match_style: pending.match_style,
                                handler: pending.handler,
                            },
                        );
                        pending
                            .result_tx
                            .send(Ok(Registration {
                                id: message.registration,
                                procedure: pending.procedure,
                                match_style: pending.match_style,
                            }))
                            .ok();
                    }
                }
                Ok(())
            }
            Message::Unregistered(message) => {
                if let Some(result_tx) = self.joined.as_mut().and_then(|joined| {
                    joined
                        .pending_unregisters
                        .remove(&message.unregister_request)
                }) {
                    result_tx.send(Ok(())).ok();
                }
                Ok(())
            }
            Message::Subscribed(message) => {
                if let Some(joined) = self.joined.as_mut() {
                    if let Some(pending) =
                        joined.pending_subscribes.remove(&message.subscribe_request)
                    {
                        debug!(
                            "Peer {} subscribed to {} as {}",
                            self.name, pending.topic, message.subscription
                        );
                        let handle = message.subscribe_request;
                        joined
                            .subscriptions
                            .entry(message.subscription)
                            .or_insert_with(|| TopicSubscription {
                                topic: pending.topic.clone(),
                                handlers: Vec::new(),
                            })
                            .handlers
                            .push((handle, pending.handler));
                        pending
                            .result_tx
                            .send(Ok(Subscription {
                                id: handle,
                                subscription: message.subscription,
                                topic: pending.topic,
                            }))
                            .ok();
                    }
                }
                Ok(())
            }
            Message::Unsubscribed(message) => {
                if let Some(result_tx) = self.joined.as_mut().and_then(|joined| {
                    joined
                        .pending_unsubscribes
                        .remove(&message.unsubscribe_request)
                }) {
                    result_tx.send(Ok(())).ok();
                }
                Ok(())
            }
            Message::Published(message) => {
                if let Some(result_tx) = self
                    .joined
                    .as_mut()
                    .and_then(|joined| joined.pending_publishes.remove(&message.publish_request))
                {
                    result_tx.send(Ok(())).ok();
                }
                Ok(())
            }
            message => Err(InteractionError::ProtocolViolation(format!(
                "received {} message on a joined session",
                message.message_name()
            ))
            .into()),
        }
    }

    fn handle_router_goodbye(&mut self, message: GoodbyeMessage) -> Result<()> {
        info!(
            "Peer {} session ended by router: {}",
            self.name, message.reason
        );
        self.drop_joined();
        self.leave_details = Some(LeaveDetails::new(message.reason, &message.details));
        self.transition(SessionState::Leaving)?;
        // The connection is torn down right after, so a failed send changes nothing.
        self.send(goodbye_and_out()).ok();
        self.transition(SessionState::Disconnected)
    }

    fn handle_invocation(&mut self, message: InvocationMessage) -> Result<()> {
        let Some(joined) = self.joined.as_mut() else {
            return Ok(());
        };
        let registration = joined
            .registrations
            .get(&message.registered_registration)
            .map(|registration| (registration.procedure.clone(), registration.handler.clone()));
        let Some((registered_procedure, handler)) = registration else {
            return self.send(error_message(
                INVOCATION,
                message.request,
                &InteractionError::NoSuchRegistration.into(),
            ));
        };
        let procedure = message
            .details
            .get("procedure")
            .and_then(Value::string)
            .and_then(|procedure| Uri::try_from(procedure).ok())
            .or_else(|| Uri::try_from(&registered_procedure).ok())
            .unwrap_or_else(|| Uri::from_known(registered_procedure.as_str()));
        joined.active_invocations.insert(message.request);
        joined.dispatcher.push(Dispatch::Invocation {
            request: message.request,
            handler,
            invocation: Invocation {
                procedure,
                arguments: message.call_arguments,
                arguments_keyword: message.call_arguments_keyword,
                details: message.details,
            },
        });
        Ok(())
    }

    fn handle_event(&mut self, message: EventMessage) {
        let Some(joined) = self.joined.as_ref() else {
            return;
        };
        let Some(subscription) = joined.subscriptions.get(&message.subscribed_subscription)
        else {
            trace!(
                "Peer {} ignoring EVENT for unknown subscription {}",
                self.name, message.subscribed_subscription
            );
            return;
        };
        let topic = message
            .details
            .get("topic")
            .and_then(Value::string)
            .and_then(|topic| Uri::try_from(topic).ok())
            .or_else(|| Uri::try_from(&subscription.topic).ok())
            .unwrap_or_else(|| Uri::from_known(subscription.topic.as_str()));
        let event = ReceivedEvent {
            topic,
            publication: message.published_publication,
            arguments: message.publish_arguments,
            arguments_keyword: message.publish_arguments_keyword,
            details: message.details,
        };
        for (_, handler) in &subscription.handlers {
            joined.dispatcher.push(Dispatch::Event {
                handler: handler.clone(),
                event: event.clone(),
            });
        }
    }

    fn handle_error(&mut self, message: ErrorMessage) {
        let Some(joined) = self.joined.as_mut() else {
            return;
        };
        let request = message.request;
        let request_type = message.request_type;
        let err = error_from_error_payload(
            message.error,
            &message.details,
            message.arguments,
            message.arguments_keyword,
        );
        let delivered = match request_type {
            CALL => joined
                .pending_calls
                .remove(&request)
                .map(|result_tx| result_tx.send(Err(err)).is_ok()),
            REGISTER => joined
                .pending_registers
                .remove(&request)
                .map(|pending| pending.result_tx.send(Err(err)).is_ok()),
            UNREGISTER => joined
                .pending_unregisters
                .remove(&request)
                .map(|result_tx| result_tx.send(Err(err)).is_ok()),
            SUBSCRIBE => joined
                .pending_subscribes
                .remove(&request)
                .map(|pending| pending.result_tx.send(Err(err)).is_ok()),
            UNSUBSCRIBE => joined
                .pending_unsubscribes
                .remove(&request)
                .map(|result_tx| result_tx.send(Err(err)).is_ok()),
            PUBLISH => joined
                .pending_publishes
                .remove(&request)
                .map(|result_tx| result_tx.send(Err(err)).is_ok()),
            _ => None,
        };
        if delivered.is_none() {
            trace!(
                "Peer {} ignoring ERROR for unknown request {request} of type {request_type}",
                self.name
            );
        }
    }

    fn handle_leaving(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Goodbye(message) => {
                let details = LeaveDetails::new(message.reason, &message.details);
                info!("Peer {} left realm: {}", self.name, details.reason);
                self.leave_details = Some(details.clone());
                self.transition(SessionState::Disconnected)?;
                if let Some(result_tx) = self.pending_leave.take() {
                    result_tx.send(Ok(details)).ok();
                }
                Ok(())
            }
            Message::Abort(message) => {
                let details = LeaveDetails::new(message.reason, &message.details);
                self.leave_details = Some(details.clone());
                self.transition(SessionState::Disconnected)?;
                if let Some(result_tx) = self.pending_leave.take() {
                    result_tx.send(Ok(details)).ok();
                }
                Ok(())
            }
            message => {
                trace!(
                    "Peer {} ignoring {} while leaving",
                    self.name,
                    message.message_name()
                );
                Ok(())
            }
        }
    }

    /// Ends the session because the router broke the protocol.
    pub fn abort(&mut self, err: &Error) {
        warn!("Peer {} aborting session: {err:#}", self.name);
        self.send(abort_message_for_error(err)).ok();
        self.end(LeaveDetails {
            reason: Uri::from_known("wamp.error.protocol_violation"),
            message: err.to_string(),
        });
    }

    /// Ends the session because the connection went away.
    pub fn transport_lost(&mut self) {
        if self.ended {
            return;
        }
        warn!("Peer {} lost its connection to the router", self.name);
        self.end(LeaveDetails::transport_lost());
    }

    fn end(&mut self, details: LeaveDetails) {
        let state = self.state.get();
        if matches!(state, SessionState::Joined | SessionState::Leaving) {
            self.leave_details.get_or_insert(details.clone());
        }
        self.drop_joined();
        if let Some(result_tx) = self.pending_join.take() {
            result_tx
                .send(Err(TransportError::new(format!(
                    "session ended while joining: {}",
                    details.message
                ))
                .into()))
                .ok();
        }
        if let Some(result_tx) = self.pending_leave.take() {
            result_tx.send(Ok(details)).ok();
        }
        if state != SessionState::Disconnected {
            if let Err(err) = self.transition(SessionState::Disconnected) {
                warn!("Peer {} failed to disconnect session: {err:#}", self.name);
            }
        }
        self.ended = true;
    }
}

/// Helpers for building the HELLO details of a peer.
pub(crate) fn hello_details(agent: &str, roles: Dictionary) -> Dictionary {
    let mut details = Dictionary::from_iter([
        ("roles".to_owned(), Value::Dictionary(roles)),
        (
            "authmethods".to_owned(),
            Value::List(List::from_iter([Value::from("anonymous")])),
        ),
    ]);
    if !agent.is_empty() {
        details.insert("agent".to_owned(), Value::from(agent));
    }
    details
}
