use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Permission scopes an API key can carry.
///
/// The string forms (`env.read`, `deploy.write`, ...) are stable: they are
/// stored in the database and shown to users, so variants must never be
/// renamed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    EnvRead,
    EnvWrite,
    DeployRead,
    DeployWrite,
    LogsRead,
    Admin,
}

impl Scope {
    pub const ALL: [Scope; 6] = [
        Scope::EnvRead,
        Scope::EnvWrite,
        Scope::DeployRead,
        Scope::DeployWrite,
        Scope::LogsRead,
        Scope::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::EnvRead => "env.read",
            Scope::EnvWrite => "env.write",
            Scope::DeployRead => "deploy.read",
            Scope::DeployWrite => "deploy.write",
            Scope::LogsRead => "logs.read",
            Scope::Admin => "admin",
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown scope: {0}")]
pub struct UnknownScope(pub String);

impl FromStr for Scope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| UnknownScope(s.to_string()))
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// `true` iff the held scopes cover every required scope. Holders of
/// [`Scope::Admin`] pass unconditionally.
pub fn satisfies(held: &[Scope], required: &[Scope]) -> bool {
    held.contains(&Scope::Admin) || required.iter().all(|scope| held.contains(scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_forms_round_trip() {
        for scope in Scope::ALL {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert!("env.admin".parse::<Scope>().is_err());
    }

    #[test]
    fn admin_passes_any_requirement() {
        assert!(satisfies(&[Scope::Admin], &[Scope::DeployWrite, Scope::LogsRead]));
    }

    #[test]
    fn requires_every_member() {
        let held = [Scope::EnvRead, Scope::EnvWrite];
        assert!(satisfies(&held, &[Scope::EnvRead]));
        assert!(satisfies(&held, &[Scope::EnvRead, Scope::EnvWrite]));
        assert!(!satisfies(&held, &[Scope::EnvRead, Scope::DeployRead]));
        assert!(satisfies(&held, &[]));
    }
}
