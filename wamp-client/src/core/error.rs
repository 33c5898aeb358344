use anyhow::Error;
use thiserror::Error;

use crate::core::{
    types::{
        Dictionary,
        List,
        Value,
    },
    uri::{
        InvalidUri,
        Uri,
    },
};

/// A standard application fault, named by a `wamp.error.*` URI.
#[derive(Debug, Error)]
pub enum BasicError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotAllowed(String),
    #[error("{0}")]
    PermissionDenied(String),
    /// Reserved for faults that no other variant describes.
    #[error("{0}")]
    Internal(String),
}

impl BasicError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAllowed(_) => "not_allowed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }
}

/// An error defined by the WAMP protocol itself.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// No callee is registered for the procedure.
    ///
    /// Recoverable: the caller may retry once a callee registers.
    #[error("no such procedure")]
    NoSuchProcedure,
    #[error("procedure already exists")]
    ProcedureAlreadyExists,
    #[error("no such registration")]
    NoSuchRegistration,
    #[error("no such subscription")]
    NoSuchSubscription,
    #[error("no such realm")]
    NoSuchRealm,
    #[error("no such role")]
    NoSuchRole,
    #[error("canceled")]
    Canceled,
}

impl InteractionError {
    /// The trailing URI component for the error.
    pub fn uri_component(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::NoSuchProcedure => "no_such_procedure",
            Self::ProcedureAlreadyExists => "procedure_already_exists",
            Self::NoSuchRegistration => "no_such_registration",
            Self::NoSuchSubscription => "no_such_subscription",
            Self::NoSuchRealm => "no_such_realm",
            Self::NoSuchRole => "no_such_role",
            Self::Canceled => "canceled",
        }
    }
}

/// An application-defined error, raised by a procedure handler or the router.
///
/// The reason URI and payload travel unmodified between the callee and the caller.
#[derive(Debug, Clone, Default, PartialEq, Error)]
#[error("{reason}: {message}")]
pub struct ApplicationError {
    pub reason: Uri,
    pub message: String,
    pub arguments: List,
    pub arguments_keyword: Dictionary,
}

impl ApplicationError {
    pub fn new<S>(reason: Uri, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            reason,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_arguments(mut self, arguments: List) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_arguments_keyword(mut self, arguments_keyword: Dictionary) -> Self {
        self.arguments_keyword = arguments_keyword;
        self
    }
}

/// The connection to the router could not be established or was lost.
///
/// Session-fatal.
#[derive(Debug, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
        }
    }
}

/// The router challenged the session for authentication, which this client never answers.
///
/// Session-fatal.
#[derive(Debug, Error)]
#[error("authentication refused: router challenged with {auth_method:?}")]
pub struct AuthenticationRefused {
    pub auth_method: String,
}

/// The operation was invalidated because its session ended, or no session was joined.
#[derive(Debug, Error)]
#[error("session closed")]
pub struct SessionClosed;

/// The call did not receive a result in time.
#[derive(Debug, Error)]
#[error("call timed out")]
pub struct CallTimeout;

/// Creates an [`struct@Error`] from a URI error reason and message.
///
/// Reasons outside of the standard set become an [`ApplicationError`].
pub fn error_from_uri_reason_and_message(reason: Uri, message: String) -> Error {
    match reason.as_str() {
        "wamp.error.not_found" => BasicError::NotFound(message).into(),
        "wamp.error.invalid_argument" => BasicError::InvalidArgument(message).into(),
        "wamp.error.not_allowed" => BasicError::NotAllowed(message).into(),
        "wamp.error.permission_denied" => BasicError::PermissionDenied(message).into(),
        "wamp.error.internal" => BasicError::Internal(message).into(),
        "wamp.error.invalid_uri" => InvalidUri { uri: message }.into(),
        "wamp.error.protocol_violation" => InteractionError::ProtocolViolation(message).into(),
        "wamp.error.no_such_procedure" => InteractionError::NoSuchProcedure.into(),
        "wamp.error.procedure_already_exists" => InteractionError::ProcedureAlreadyExists.into(),
        "wamp.error.no_such_registration" => InteractionError::NoSuchRegistration.into(),
        "wamp.error.no_such_subscription" => InteractionError::NoSuchSubscription.into(),
        "wamp.error.no_such_realm" => InteractionError::NoSuchRealm.into(),
        "wamp.error.no_such_role" => InteractionError::NoSuchRole.into(),
        "wamp.error.canceled" => InteractionError::Canceled.into(),
        _ => ApplicationError::new(reason, message).into(),
    }
}

/// The human-readable message of an error description.
///
/// Taken from the `message` detail if present, otherwise from a leading string argument.
pub fn error_message_text(details: &Dictionary, arguments: &List) -> String {
    match (details.get("message"), arguments.first()) {
        (Some(Value::String(message)), _) => message.clone(),
        (_, Some(Value::String(message))) => message.clone(),
        _ => String::new(),
    }
}

/// Creates an [`struct@Error`] from the contents of an ERROR message.
///
/// An [`ApplicationError`] keeps the full payload.
pub fn error_from_error_payload(
    reason: Uri,
    details: &Dictionary,
    arguments: List,
    arguments_keyword: Dictionary,
) -> Error {
    let message = error_message_text(details, &arguments);
    let error = error_from_uri_reason_and_message(reason, message);
    match error.downcast::<ApplicationError>() {
        Ok(error) => error
            .with_arguments(arguments)
            .with_arguments_keyword(arguments_keyword)
            .into(),
        Err(error) => error,
    }
}

/// The URI that describes the error on the wire.
pub fn error_uri(error: &Error) -> Uri {
    if let Some(error) = error.downcast_ref::<ApplicationError>() {
        error.reason.clone()
    } else if let Some(error) = error.downcast_ref::<BasicError>() {
        Uri::from_known(format!("wamp.error.{}", error.uri_component()))
    } else if let Some(error) = error.downcast_ref::<InteractionError>() {
        Uri::from_known(format!("wamp.error.{}", error.uri_component()))
    } else if error.is::<InvalidUri>() {
        Uri::from_known("wamp.error.invalid_uri")
    } else if error.is::<CallTimeout>() {
        Uri::from_known("wamp.error.timeout")
    } else {
        Uri::from_known("wamp.error.runtime_error")
    }
}

/// Checks if a failed call may simply be tried again later.
pub fn recoverable_call_error(error: &Error) -> bool {
    error.is::<CallTimeout>()
        || error
            .downcast_ref::<InteractionError>()
            .is_some_and(|error| matches!(error, InteractionError::NoSuchProcedure))
}

/// Checks if the error ends the session and should be reported to the host process.
pub fn session_fatal_error(error: &Error) -> bool {
    error.is::<TransportError>() || error.is::<AuthenticationRefused>()
}

#[cfg(test)]
mod error_test {
    use anyhow::Error;

    use crate::core::{
        error::{
            ApplicationError,
            AuthenticationRefused,
            BasicError,
            CallTimeout,
            InteractionError,
            SessionClosed,
            TransportError,
            error_from_error_payload,
            error_from_uri_reason_and_message,
            error_uri,
            recoverable_call_error,
            session_fatal_error,
        },
        types::{
            Dictionary,
            List,
            Value,
        },
        uri::{
            InvalidUri,
            Uri,
        },
    };

    fn uri(value: &str) -> Uri {
        Uri::try_from(value).unwrap()
    }

    #[test]
    fn maps_standard_reasons_to_typed_errors() {
        assert_matches::assert_matches!(
            error_from_uri_reason_and_message(uri("wamp.error.no_such_procedure"), String::new())
                .downcast::<InteractionError>(),
            Ok(InteractionError::NoSuchProcedure)
        );
        assert_matches::assert_matches!(
            error_from_uri_reason_and_message(uri("wamp.error.not_allowed"), "nope".to_owned())
                .downcast::<BasicError>(),
            Ok(BasicError::NotAllowed(message)) => {
                assert_eq!(message, "nope");
            }
        );
        assert!(
            error_from_uri_reason_and_message(uri("wamp.error.invalid_uri"), String::new())
                .is::<InvalidUri>()
        );
    }

    #[test]
    fn keeps_application_payload_for_unknown_reasons() {
        let error = error_from_error_payload(
            uri("com.example.error.overflow"),
            &Dictionary::default(),
            List::from_iter([Value::from("too big"), Value::from(7u64)]),
            Dictionary::from_iter([("limit".to_owned(), Value::from(5u64))]),
        );
        assert_matches::assert_matches!(error.downcast::<ApplicationError>(), Ok(error) => {
            pretty_assertions::assert_eq!(error, ApplicationError {
                reason: uri("com.example.error.overflow"),
                message: "too big".to_owned(),
                arguments: List::from_iter([Value::from("too big"), Value::from(7u64)]),
                arguments_keyword: Dictionary::from_iter([("limit".to_owned(), Value::from(5u64))]),
            });
        });
    }

    #[test]
    fn error_uri_round_trips_typed_errors() {
        assert_eq!(
            error_uri(&InteractionError::ProcedureAlreadyExists.into()),
            uri("wamp.error.procedure_already_exists")
        );
        assert_eq!(
            error_uri(&BasicError::InvalidArgument("bad".to_owned()).into()),
            uri("wamp.error.invalid_argument")
        );
        assert_eq!(
            error_uri(&ApplicationError::new(uri("com.example.error"), "oops").into()),
            uri("com.example.error")
        );
        assert_eq!(
            error_uri(&Error::msg("something else")),
            uri("wamp.error.runtime_error")
        );
    }

    #[test]
    fn classifies_errors() {
        assert!(recoverable_call_error(&InteractionError::NoSuchProcedure.into()));
        assert!(recoverable_call_error(&CallTimeout.into()));
        assert!(!recoverable_call_error(
            &ApplicationError::new(uri("com.example.error"), "oops").into()
        ));
        assert!(!recoverable_call_error(&SessionClosed.into()));

        assert!(session_fatal_error(&TransportError::new("refused").into()));
        assert!(session_fatal_error(
            &AuthenticationRefused {
                auth_method: "ticket".to_owned()
            }
            .into()
        ));
        assert!(!session_fatal_error(&InteractionError::NoSuchProcedure.into()));
        assert!(session_fatal_error(
            &Error::from(TransportError::new("reset")).context("failed to connect")
        ));
    }
}
