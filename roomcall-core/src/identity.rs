//! Participant identity
//!
//! Two identities coexist in a chat room. The relay assigns every connected
//! client an ephemeral [`SessionId`] that is only valid for one connection
//! lifetime, while users pick a stable display name. Private-call requests are
//! addressed by display name (the caller does not know the callee's session id
//! yet); everything after the first reply is addressed by session id.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Ephemeral identifier the signaling relay assigns to a connected client
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a session id from any string-like value
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A member of the chat room
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Session id, valid for the lifetime of this member's connection
    pub id: SessionId,
    /// Stable user-facing name
    pub display_name: String,
}

impl Participant {
    /// Create a participant
    pub fn new(id: impl Into<SessionId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// Whether `other` refers to this participant's current session
    pub fn is(&self, other: &SessionId) -> bool {
        &self.id == other
    }
}

impl Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}
