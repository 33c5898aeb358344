use crate::core::types::{
    Dictionary,
    Value,
};

/// A role a client peer takes on within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    Caller,
    Callee,
    Publisher,
    Subscriber,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }

    /// Advanced features this client implements for the role.
    fn features(&self) -> &'static [&'static str] {
        match self {
            Self::Caller => &["call_canceling"],
            Self::Callee => &[
                "call_canceling",
                "pattern_based_registration",
                "shared_registration",
            ],
            Self::Publisher => &["publisher_exclusion"],
            Self::Subscriber => &["pattern_based_subscription"],
        }
    }
}

/// All roles, in the order they are announced.
pub const ALL_PEER_ROLES: [PeerRole; 4] = [
    PeerRole::Caller,
    PeerRole::Callee,
    PeerRole::Publisher,
    PeerRole::Subscriber,
];

/// The `roles` detail of HELLO.
pub fn roles_details<'r, I>(roles: I) -> Dictionary
where
    I: IntoIterator<Item = &'r PeerRole>,
{
    roles
        .into_iter()
        .map(|role| {
            let features = role
                .features()
                .iter()
                .map(|feature| ((*feature).to_owned(), Value::Bool(true)))
                .collect::<Dictionary>();
            (
                role.as_str().to_owned(),
                Value::Dictionary(Dictionary::from_iter([(
                    "features".to_owned(),
                    Value::Dictionary(features),
                )])),
            )
        })
        .collect()
}

#[cfg(test)]
mod roles_test {
    use crate::core::{
        roles::{
            ALL_PEER_ROLES,
            PeerRole,
            roles_details,
        },
        types::{
            Value,
            lookup,
        },
    };

    #[test]
    fn announces_features_per_role() {
        let details = roles_details(&ALL_PEER_ROLES);
        assert_eq!(details.len(), 4);
        assert_eq!(
            lookup(&details, &["callee", "features", "shared_registration"]),
            Some(&Value::Bool(true))
        );
        assert_eq!(
            lookup(&details, &["publisher", "features", "publisher_exclusion"]),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn announces_only_requested_roles() {
        let details = roles_details(&[PeerRole::Subscriber]);
        assert_eq!(details.len(), 1);
        assert!(details.contains_key("subscriber"));
    }
}
