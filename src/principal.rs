//! Authenticated principals supplied by the identity provider.

use serde::{Deserialize, Serialize};

/// An authenticated identity for the current session.
///
/// Principals are owned by the identity provider; this crate only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    uid: String,
    email: String,
    display_name: Option<String>,
}

impl Principal {
    /// Create a new principal.
    pub fn new(uid: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            email: email.into(),
            display_name: None,
        }
    }

    /// Set the display name for the principal.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Get the principal's unique identifier.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Get the email exactly as the identity provider reported it.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Get the principal's display name.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} <{}> ({})", name, self.email, self.uid),
            None => write!(f, "<{}> ({})", self.email, self.uid),
        }
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
