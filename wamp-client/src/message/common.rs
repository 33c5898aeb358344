use anyhow::Error;

use crate::{
    core::{
        close::CloseReason,
        error::{
            ApplicationError,
            error_uri,
        },
        id::Id,
        types::{
            Dictionary,
            Integer,
            Value,
        },
        uri::Uri,
    },
    message::message::{
        AbortMessage,
        ErrorMessage,
        GoodbyeMessage,
        Message,
    },
};

fn message_details(error: &Error) -> Dictionary {
    Dictionary::from_iter([("message".to_owned(), Value::String(error.to_string()))])
}

pub fn abort_message_for_error(error: &Error) -> Message {
    Message::Abort(AbortMessage {
        details: message_details(error),
        reason: error_uri(error),
        ..Default::default()
    })
}

pub fn abort_message_for_reason(reason: Uri, message: &str) -> Message {
    Message::Abort(AbortMessage {
        details: Dictionary::from_iter([("message".to_owned(), Value::from(message))]),
        reason,
        ..Default::default()
    })
}

pub fn goodbye_with_close_reason(close_reason: CloseReason) -> Message {
    Message::Goodbye(GoodbyeMessage {
        details: Dictionary::default(),
        reason: close_reason.uri(),
    })
}

pub fn goodbye_and_out() -> Message {
    goodbye_with_close_reason(CloseReason::GoodbyeAndOut)
}

/// The ERROR reply to a request.
pub fn error_for_request(message: &Message, error: &Error) -> Message {
    error_message(
        message.message_type(),
        message.request_id().unwrap_or_default(),
        error,
    )
}

/// An ERROR message for a request of the given type.
///
/// An [`ApplicationError`] is forwarded with its own reason and payload.
pub fn error_message(request_type: Integer, request: Id, error: &Error) -> Message {
    match error.downcast_ref::<ApplicationError>() {
        Some(application_error) => Message::Error(ErrorMessage {
            request_type,
            request,
            details: Dictionary::from_iter([(
                "message".to_owned(),
                Value::String(application_error.message.clone()),
            )]),
            error: application_error.reason.clone(),
            arguments: application_error.arguments.clone(),
            arguments_keyword: application_error.arguments_keyword.clone(),
        }),
        None => Message::Error(ErrorMessage {
            request_type,
            request,
            details: message_details(error),
            error: error_uri(error),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod common_test {
    use anyhow::Error;

    use crate::{
        core::{
            error::{
                ApplicationError,
                InteractionError,
            },
            id::Id,
            types::{
                Dictionary,
                List,
                Value,
            },
            uri::Uri,
        },
        message::{
            common::error_for_request,
            message::{
                ErrorMessage,
                InvocationMessage,
                Message,
            },
        },
    };

    fn invocation() -> Message {
        Message::Invocation(InvocationMessage {
            request: Id::try_from(9).unwrap(),
            registered_registration: Id::try_from(3).unwrap(),
            ..Default::default()
        })
    }

    #[test]
    fn forwards_application_error_payload() {
        let error = ApplicationError::new(Uri::try_from("com.example.error.overflow").unwrap(), "too big")
            .with_arguments(List::from_iter([Value::Integer(100)]));
        pretty_assertions::assert_eq!(
            error_for_request(&invocation(), &error.into()),
            Message::Error(ErrorMessage {
                request_type: 68,
                request: Id::try_from(9).unwrap(),
                details: Dictionary::from_iter([("message".to_owned(), Value::from("too big"))]),
                error: Uri::try_from("com.example.error.overflow").unwrap(),
                arguments: List::from_iter([Value::Integer(100)]),
                arguments_keyword: Dictionary::default(),
            })
        );
    }

    #[test]
    fn describes_other_errors_by_uri() {
        assert_matches::assert_matches!(
            error_for_request(&invocation(), &InteractionError::Canceled.into()),
            Message::Error(message) => {
                assert_eq!(message.error.as_str(), "wamp.error.canceled");
            }
        );
        assert_matches::assert_matches!(
            error_for_request(&invocation(), &Error::msg("division by zero")),
            Message::Error(message) => {
                assert_eq!(message.error.as_str(), "wamp.error.runtime_error");
                assert_eq!(message.details.get("message"), Some(&Value::from("division by zero")));
            }
        );
    }
}
