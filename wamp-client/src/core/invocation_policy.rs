use std::{
    fmt::Display,
    str::FromStr,
};

use anyhow::Error;

/// How the router picks a callee when several sessions register the same procedure.
///
/// Sent as the `invoke` option of REGISTER; the client never applies it itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationPolicy {
    /// Only one registration is allowed.
    #[default]
    Single,
    RoundRobin,
    Random,
    First,
    Last,
}

impl InvocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::RoundRobin => "roundrobin",
            Self::Random => "random",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

impl Display for InvocationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvocationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            _ => Err(Error::msg(format!("invalid invocation policy: {s}"))),
        }
    }
}

#[cfg(test)]
mod invocation_policy_test {
    use crate::core::invocation_policy::InvocationPolicy;

    #[test]
    fn parses_wire_names() {
        assert_matches::assert_matches!("roundrobin".parse::<InvocationPolicy>(), Ok(InvocationPolicy::RoundRobin));
        assert_matches::assert_matches!("single".parse::<InvocationPolicy>(), Ok(InvocationPolicy::Single));
        assert_matches::assert_matches!("round_robin".parse::<InvocationPolicy>(), Err(_));
        assert_eq!(InvocationPolicy::Last.to_string(), "last");
    }
}
