use std::{
    fmt::Display,
    str::FromStr,
};

use anyhow::Error;

/// How a registration or subscription URI is matched against concrete URIs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStyle {
    /// The default, which is not sent on the wire.
    #[default]
    Exact,
    Prefix,
    /// Empty URI components match any component.
    Wildcard,
}

impl MatchStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Prefix => "prefix",
            Self::Wildcard => "wildcard",
        }
    }
}

impl Display for MatchStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "wildcard" => Ok(Self::Wildcard),
            _ => Err(Error::msg(format!("invalid match style: {s}"))),
        }
    }
}
