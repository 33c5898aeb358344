mod connector;
mod dispatcher;
mod handler;
mod peer;
mod session;
mod state;
mod web_socket_peer;

pub use connector::{
    connector::{
        Connector,
        ConnectorFactory,
    },
    web_socket_connector::WebSocketConnectorFactory,
};
pub use handler::{
    Invocation,
    Procedure,
    ReceivedEvent,
    RpcYield,
    Subscriber,
    procedure_fn,
    subscriber_fn,
};
pub use peer::{
    Peer,
    PeerConfig,
    ProcedureOptions,
    PublishOptions,
    PublishedEvent,
    Registration,
    RpcCall,
    RpcResult,
    Subscription,
    SubscriptionOptions,
    WebSocketConfig,
};
pub use session::{
    LeaveDetails,
    SessionDetails,
};
pub use state::SessionState;
pub use web_socket_peer::new_web_socket_peer;
