//! Peer contact records
//!
//! The conversation layer owns contacts; a call only needs the identity used
//! for signaling plus the presentation fields it hands back to the UI.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// String-based peer identity used to address signaling messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Contact record supplied by the conversation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerContact {
    /// Identity used for signaling
    pub identity: PeerId,
    /// Name shown by presentation code
    pub display_name: String,
    /// Opaque avatar reference (URL, content hash, ...)
    pub avatar_reference: Option<String>,
}

impl PeerContact {
    /// Contact whose display name is its identity
    pub fn new(identity: impl Into<PeerId>) -> Self {
        let identity = identity.into();
        Self {
            display_name: identity.to_string(),
            identity,
            avatar_reference: None,
        }
    }

    /// Set the display name
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar_reference = Some(avatar.into());
        self
    }
}
