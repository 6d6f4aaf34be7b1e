//! Logical user identities
//!
//! An [`Identity`] is the stable address of a platform user: a role plus an
//! id, independent of any transport connection. It replaces the ad-hoc
//! string-concatenated room keys the signaling surface historically used,
//! so the client and relay share one parse/format implementation.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

/// Platform role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Platform administrator
    Admin,
    /// Medical staff
    Doctor,
    /// Patient
    Patient,
}

impl Role {
    /// Wire/display name of the role
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Patient => "patient",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "doctor" => Ok(Self::Doctor),
            "patient" => Ok(Self::Patient),
            other => Err(IdentityParseError::UnknownRole(other.to_string())),
        }
    }
}

/// Error parsing an identity from its string form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityParseError {
    /// Role segment is not a known role
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// Missing the `role:id` separator
    #[error("malformed identity (expected role:id): {0}")]
    Malformed(String),

    /// Empty id segment
    #[error("empty identity id")]
    EmptyId,
}

/// Logical address of a user: role plus id.
///
/// Formats as `"<role>:<id>"`, e.g. `doctor:42`. The id `*` addresses every
/// connection joined under the role-wide broadcast identity; a connection may
/// hold its personal identity and the broadcast identity simultaneously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    /// Role of the addressed user
    pub role: Role,
    /// Stable user id within the role
    pub id: String,
}

/// Id segment used for role-wide broadcast identities.
const BROADCAST_ID: &str = "*";

impl Identity {
    /// Create an identity from a role and id.
    pub fn new(role: Role, id: impl Into<String>) -> Self {
        Self {
            role,
            id: id.into(),
        }
    }

    /// The role-wide broadcast identity for `role`.
    #[must_use]
    pub fn broadcast(role: Role) -> Self {
        Self::new(role, BROADCAST_ID)
    }

    /// Whether this identity addresses a whole role rather than one user.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.id == BROADCAST_ID
    }

    /// Parse an identity from its `role:id` string form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not of the form `role:id` with a
    /// known role and a non-empty id.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(s.parse()?)
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

impl FromStr for Identity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role, id) = s
            .split_once(':')
            .ok_or_else(|| IdentityParseError::Malformed(s.to_string()))?;
        if id.is_empty() {
            return Err(IdentityParseError::EmptyId);
        }
        Ok(Self {
            role: role.parse()?,
            id: id.to_string(),
        })
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.to_string()
    }
}
