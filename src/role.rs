//! Role definitions and impersonation overrides.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Access level of a principal on the marketplace.
///
/// Variants are declared from least to most privileged; `Ord` follows
/// [`Role::privilege_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Not signed in, or signed in without a user record yet.
    Guest,
    /// Regular signed-in member.
    User,
    /// Helps a coach run their programs.
    AssistantCoach,
    /// Publishes lessons and videos. Stored as `coach`, `creator` is accepted.
    #[serde(alias = "creator")]
    Coach,
    /// Moderates content and users.
    Admin,
    /// Owns the platform and may impersonate every other role.
    Superadmin,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl Role {
    /// Every role, least privileged first.
    pub const ALL: [Role; 6] = [
        Role::Guest,
        Role::User,
        Role::AssistantCoach,
        Role::Coach,
        Role::Admin,
        Role::Superadmin,
    ];

    /// Get the string representation of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::User => "user",
            Role::AssistantCoach => "assistant_coach",
            Role::Coach => "coach",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    /// Numeric rank, higher is more privileged.
    pub fn privilege_level(&self) -> u8 {
        match self {
            Role::Guest => 0,
            Role::User => 1,
            Role::AssistantCoach => 2,
            Role::Coach => 3,
            Role::Admin => 4,
            Role::Superadmin => 5,
        }
    }

    /// Whether this role may switch into other roles.
    pub fn is_superadmin_class(&self) -> bool {
        matches!(self, Role::Superadmin)
    }

    /// Parse a role name, accepting the aliases used in links and legacy documents.
    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "guest" => Ok(Role::Guest),
            "user" => Ok(Role::User),
            "assistant_coach" | "assistantcoach" => Ok(Role::AssistantCoach),
            "coach" | "creator" => Ok(Role::Coach),
            "admin" => Ok(Role::Admin),
            "superadmin" | "super_admin" => Ok(Role::Superadmin),
            _ => Err(Error::InvalidRole(value.to_string())),
        }
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.privilege_level().cmp(&other.privilege_level())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A persisted "view the product as another role" override.
///
/// Created by a superadmin switch, valid for a fixed TTL from `created_at`.
/// `original_role` is the role captured before the first switch and survives
/// repeated switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleOverride {
    /// The role the principal really holds.
    pub original_role: Role,
    /// The role the principal is currently viewing the product as.
    pub current_role: Role,
    /// Whether the override is in effect.
    pub is_testing_mode: bool,
    /// When the override was written.
    pub created_at: DateTime<Utc>,
}

impl RoleOverride {
    /// Create an active override created at `now`.
    pub fn new(original_role: Role, current_role: Role, now: DateTime<Utc>) -> Self {
        Self {
            original_role,
            current_role,
            is_testing_mode: true,
            created_at: now,
        }
    }

    /// Check if the override has outlived `ttl`.
    ///
    /// A `created_at` in the future (clock skew) counts as fresh.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match (now - self.created_at).to_std() {
            Ok(elapsed) => elapsed > ttl,
            Err(_) => false,
        }
    }

    /// Check if the override should drive role resolution at `now`.
    pub fn is_active(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.is_testing_mode && !self.is_expired(now, ttl)
    }

    /// When the override stops applying.
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Get the time remaining before the override expires.
    pub fn time_remaining(&self, now: DateTime<Utc>, ttl: Duration) -> Duration {
        (self.expires_at(ttl) - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::parse("user").unwrap(), Role::User);
        assert_eq!(Role::parse("Creator").unwrap(), Role::Coach);
        assert_eq!(Role::parse("assistant-coach").unwrap(), Role::AssistantCoach);
        assert_eq!(" superadmin ".parse::<Role>().unwrap(), Role::Superadmin);
        assert!(matches!(Role::parse("root"), Err(Error::InvalidRole(_))));
        assert!(Role::parse("").is_err());
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Superadmin > Role::Admin);
        assert!(Role::Coach > Role::AssistantCoach);
        assert!(Role::User > Role::Guest);

        let mut sorted = Role::ALL;
        sorted.sort();
        assert_eq!(sorted, Role::ALL);
    }

    #[test]
    fn test_role_display_round_trips_through_parse() {
        for role in Role::ALL {
            assert_eq!(Role::parse(&role.to_string()).unwrap(), role);
        }
    }

    #[test]
    fn test_role_serde_accepts_creator_alias() {
        let role: Role = serde_json::from_str("\"creator\"").unwrap();
        assert_eq!(role, Role::Coach);
        assert_eq!(serde_json::to_string(&Role::AssistantCoach).unwrap(), "\"assistant_coach\"");
    }

    #[test]
    fn test_only_superadmin_is_superadmin_class() {
        let privileged: Vec<_> = Role::ALL.iter().filter(|r| r.is_superadmin_class()).collect();
        assert_eq!(privileged, vec![&Role::Superadmin]);
    }

    #[test]
    fn test_override_expiry() {
        let now = Utc::now();
        let fresh = RoleOverride::new(Role::Superadmin, Role::User, now);
        assert!(fresh.is_active(now, WEEK));
        assert_eq!(fresh.time_remaining(now, WEEK), WEEK);

        let stale = RoleOverride::new(Role::Superadmin, Role::User, now - chrono::Duration::days(8));
        assert!(stale.is_expired(now, WEEK));
        assert!(!stale.is_active(now, WEEK));
        assert_eq!(stale.time_remaining(now, WEEK), Duration::ZERO);

        // Exactly at the TTL boundary the override still applies.
        let boundary = RoleOverride::new(Role::Superadmin, Role::Coach, now - chrono::Duration::days(7));
        assert!(boundary.is_active(now, WEEK));
    }

    #[test]
    fn test_override_disabled_testing_mode() {
        let now = Utc::now();
        let mut disabled = RoleOverride::new(Role::Superadmin, Role::Admin, now);
        disabled.is_testing_mode = false;
        assert!(!disabled.is_expired(now, WEEK));
        assert!(!disabled.is_active(now, WEEK));
    }

    #[test]
    fn test_future_created_at_counts_as_fresh() {
        let now = Utc::now();
        let skewed = RoleOverride::new(Role::Superadmin, Role::User, now + chrono::Duration::minutes(5));
        assert!(skewed.is_active(now, WEEK));
    }
}
