//! Effective-role resolution.
//!
//! Resolution is a pure function of its inputs: the principal, their record,
//! an optional per-request role-view value, the role held by an active freeze
//! window, and the current time. Precedence, first match wins:
//!
//! 1. no principal → `guest`
//! 2. freeze window active with a cached role → the cached role
//! 3. base role not superadmin-class → the stored role (`guest` without a record)
//! 4. valid role-view parameter → that role (never written anywhere)
//! 5. override in testing mode and within TTL → `current_role`
//! 6. otherwise → the base role

use crate::{
    principal::Principal,
    record::UserRecord,
    role::Role,
};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Where a resolved role came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleSource {
    /// No authenticated principal.
    Unauthenticated,
    /// A freeze window answered with the last-known role.
    Frozen,
    /// Authenticated, but no user record exists yet.
    MissingRecord,
    /// The persisted role.
    Stored,
    /// The per-request role-view parameter.
    RequestView,
    /// An active impersonation override.
    Override,
}

/// The outcome of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// The role to authorize with.
    pub role: Role,
    /// Which rule produced it.
    pub source: RoleSource,
    /// An override document exists but has expired and should be cleared on
    /// the next write.
    pub stale_override: bool,
}

impl Resolution {
    fn new(role: Role, source: RoleSource) -> Self {
        Self {
            role,
            source,
            stale_override: false,
        }
    }
}

/// Parsed per-request role-view parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleView(pub Role);

impl RoleView {
    /// Parse a raw parameter value; unknown roles yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        Role::parse(value).ok().map(RoleView)
    }

    /// Extract `key` from a raw query string such as `tab=videos&viewAs=coach`.
    ///
    /// The last occurrence wins. A leading `?` is ignored.
    pub fn from_query(query: &str, key: &str) -> Option<Self> {
        query
            .trim_start_matches('?')
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(k, _)| *k == key)
            .last()
            .and_then(|(_, v)| Self::parse(v))
    }

    /// Get the viewed role.
    pub fn role(&self) -> Role {
        self.0
    }
}

/// Resolves effective roles under a fixed override TTL.
#[derive(Debug, Clone, Copy)]
pub struct RoleResolver {
    override_ttl: Duration,
}

impl RoleResolver {
    /// Create a resolver with the given override TTL.
    pub fn new(override_ttl: Duration) -> Self {
        Self { override_ttl }
    }

    /// Get the override TTL.
    pub fn override_ttl(&self) -> Duration {
        self.override_ttl
    }

    /// Resolve the effective role and report which rule produced it.
    pub fn resolve(
        &self,
        principal: Option<&Principal>,
        record: Option<&UserRecord>,
        view_param: Option<&str>,
        frozen: Option<Role>,
        now: DateTime<Utc>,
    ) -> Resolution {
        if principal.is_none() {
            return Resolution::new(Role::Guest, RoleSource::Unauthenticated);
        }

        if let Some(role) = frozen {
            return Resolution::new(role, RoleSource::Frozen);
        }

        let Some(record) = record else {
            return Resolution::new(Role::Guest, RoleSource::MissingRecord);
        };

        let base_role = record.base_role();
        if !base_role.is_superadmin_class() {
            return Resolution::new(record.role, RoleSource::Stored);
        }

        let stale_override = record.has_stale_override(now, self.override_ttl);

        if let Some(view) = view_param.and_then(RoleView::parse) {
            return Resolution {
                role: view.role(),
                source: RoleSource::RequestView,
                stale_override,
            };
        }

        if let Some(role_override) = record.active_override(now, self.override_ttl) {
            return Resolution::new(role_override.current_role, RoleSource::Override);
        }

        Resolution {
            role: base_role,
            source: RoleSource::Stored,
            stale_override,
        }
    }

    /// Resolve just the effective role.
    pub fn effective_role(
        &self,
        principal: Option<&Principal>,
        record: Option<&UserRecord>,
        view_param: Option<&str>,
        frozen: Option<Role>,
        now: DateTime<Utc>,
    ) -> Role {
        self.resolve(principal, record, view_param, frozen, now).role
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RoleOverride;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn resolver() -> RoleResolver {
        RoleResolver::new(WEEK)
    }

    fn principal() -> Principal {
        Principal::new("uid-1", "someone@example.com")
    }

    fn switched(now: DateTime<Utc>, target: Role, age: chrono::Duration) -> UserRecord {
        let mut record = UserRecord::new("uid-1", target, now);
        record.role_override = Some(RoleOverride::new(Role::Superadmin, target, now - age));
        record
    }

    #[test]
    fn test_unauthenticated_is_guest() {
        let now = Utc::now();
        let record = UserRecord::new("uid-1", Role::Superadmin, now);
        let resolution = resolver().resolve(None, Some(&record), Some("admin"), Some(Role::Admin), now);

        assert_eq!(resolution.role, Role::Guest);
        assert_eq!(resolution.source, RoleSource::Unauthenticated);
    }

    #[test]
    fn test_missing_record_is_guest() {
        let p = principal();
        let resolution = resolver().resolve(Some(&p), None, None, None, Utc::now());
        assert_eq!(resolution.role, Role::Guest);
        assert_eq!(resolution.source, RoleSource::MissingRecord);
    }

    #[test]
    fn test_freeze_takes_precedence() {
        let now = Utc::now();
        let p = principal();
        let record = UserRecord::new("uid-1", Role::Superadmin, now);

        let resolution = resolver().resolve(Some(&p), Some(&record), Some("user"), Some(Role::Coach), now);
        assert_eq!(resolution.role, Role::Coach);
        assert_eq!(resolution.source, RoleSource::Frozen);
    }

    #[test]
    fn test_non_superadmin_ignores_view_param() {
        let now = Utc::now();
        let p = principal();
        let record = UserRecord::new("uid-1", Role::User, now);

        let resolution = resolver().resolve(Some(&p), Some(&record), Some("admin"), None, now);
        assert_eq!(resolution.role, Role::User);
        assert_eq!(resolution.source, RoleSource::Stored);
    }

    #[test]
    fn test_view_param_for_superadmin() {
        let now = Utc::now();
        let p = principal();
        let record = UserRecord::new("uid-1", Role::Superadmin, now);

        let resolution = resolver().resolve(Some(&p), Some(&record), Some("user"), None, now);
        assert_eq!(resolution.role, Role::User);
        assert_eq!(resolution.source, RoleSource::RequestView);
    }

    #[test]
    fn test_view_param_beats_override() {
        let now = Utc::now();
        let p = principal();
        let record = switched(now, Role::Coach, chrono::Duration::hours(1));

        let role = resolver().effective_role(Some(&p), Some(&record), Some("assistant_coach"), None, now);
        assert_eq!(role, Role::AssistantCoach);
    }

    #[test]
    fn test_invalid_view_param_falls_through() {
        let now = Utc::now();
        let p = principal();
        let record = switched(now, Role::Coach, chrono::Duration::hours(1));

        let resolution = resolver().resolve(Some(&p), Some(&record), Some("overlord"), None, now);
        assert_eq!(resolution.role, Role::Coach);
        assert_eq!(resolution.source, RoleSource::Override);
    }

    #[test]
    fn test_active_override() {
        let now = Utc::now();
        let p = principal();
        let record = switched(now, Role::User, chrono::Duration::days(6));

        let resolution = resolver().resolve(Some(&p), Some(&record), None, None, now);
        assert_eq!(resolution.role, Role::User);
        assert_eq!(resolution.source, RoleSource::Override);
        assert!(!resolution.stale_override);
    }

    #[test]
    fn test_override_applies_while_persisted_role_is_still_superadmin() {
        let now = Utc::now();
        let p = principal();
        let mut record = UserRecord::new("uid-1", Role::Superadmin, now);
        record.role_override = Some(RoleOverride::new(Role::Superadmin, Role::Admin, now));

        assert_eq!(resolver().effective_role(Some(&p), Some(&record), None, None, now), Role::Admin);
    }

    #[test]
    fn test_expired_override_is_ignored_and_flagged() {
        let now = Utc::now();
        let p = principal();
        let mut record = UserRecord::new("uid-1", Role::Superadmin, now);
        record.role_override = Some(RoleOverride::new(
            Role::Superadmin,
            Role::User,
            now - chrono::Duration::days(8),
        ));

        let resolution = resolver().resolve(Some(&p), Some(&record), None, None, now);
        assert_eq!(resolution.role, Role::Superadmin);
        assert_eq!(resolution.source, RoleSource::Stored);
        assert!(resolution.stale_override);
    }

    #[test]
    fn test_expired_override_after_switch_resolves_to_original() {
        let now = Utc::now();
        let p = principal();
        let record = switched(now, Role::User, chrono::Duration::days(30));

        assert_eq!(
            resolver().effective_role(Some(&p), Some(&record), None, None, now),
            Role::Superadmin
        );
    }

    #[test]
    fn test_disabled_testing_mode_is_ignored() {
        let now = Utc::now();
        let p = principal();
        let mut record = UserRecord::new("uid-1", Role::Superadmin, now);
        let mut role_override = RoleOverride::new(Role::Superadmin, Role::Coach, now);
        role_override.is_testing_mode = false;
        record.role_override = Some(role_override);

        let resolution = resolver().resolve(Some(&p), Some(&record), None, None, now);
        assert_eq!(resolution.role, Role::Superadmin);
        assert!(!resolution.stale_override);
    }

    #[test]
    fn test_role_view_query_parsing() {
        assert_eq!(RoleView::from_query("?viewAs=coach", "viewAs"), Some(RoleView(Role::Coach)));
        assert_eq!(
            RoleView::from_query("tab=videos&viewAs=user&page=2", "viewAs").map(|v| v.role()),
            Some(Role::User)
        );
        assert_eq!(
            RoleView::from_query("viewAs=user&viewAs=admin", "viewAs"),
            Some(RoleView(Role::Admin))
        );
        assert_eq!(RoleView::from_query("viewAs=wizard", "viewAs"), None);
        assert_eq!(RoleView::from_query("role=coach", "viewAs"), None);
        assert_eq!(RoleView::from_query("", "viewAs"), None);
    }
}
