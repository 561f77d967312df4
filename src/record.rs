//! Persisted documents: user records, partial updates, profiles and creator applications.

use crate::{
    permission::{derive_permissions, CapabilitySet},
    role::{Role, RoleOverride},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// The single source of truth for one principal's access level.
///
/// `permissions` always mirrors `role`; the only way to change either is a
/// [`RecordPatch`], which derives one from the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub permissions: CapabilitySet,
    #[serde(default)]
    pub role_override: Option<RoleOverride>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// Create a record holding `role` and its derived permissions.
    pub fn new(uid: impl Into<String>, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            display_name: None,
            role,
            permissions: derive_permissions(role),
            role_override: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The role this principal really holds.
    ///
    /// A switch rewrites `role` to the impersonated role, so while an override
    /// document exists its `original_role` is authoritative. Both fields are
    /// written only by superadmin-authorized writes; `current_role` is never
    /// used here.
    pub fn base_role(&self) -> Role {
        self.role_override
            .as_ref()
            .map(|o| o.original_role)
            .unwrap_or(self.role)
    }

    /// Get the override if it still applies at `now`.
    pub fn active_override(&self, now: DateTime<Utc>, ttl: Duration) -> Option<&RoleOverride> {
        self.role_override.as_ref().filter(|o| o.is_active(now, ttl))
    }

    /// Check if an override document exists but has outlived `ttl`.
    pub fn has_stale_override(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.role_override
            .as_ref()
            .is_some_and(|o| o.is_expired(now, ttl))
    }

    /// Check the stored permissions against the stored role.
    pub fn permissions_consistent(&self) -> bool {
        self.permissions == derive_permissions(self.role)
    }
}

/// What a patch does to the `roleOverride` field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OverridePatch {
    /// Leave the field as it is.
    #[default]
    Keep,
    /// Replace the field.
    Set(RoleOverride),
    /// Delete the field.
    Clear,
}

/// A partial update merged into a [`UserRecord`].
///
/// Setting a role always sets the matching permissions in the same patch, so
/// a merged record can never carry permissions for a role it does not hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    role: Option<Role>,
    role_override: OverridePatch,
    email: Option<String>,
    display_name: Option<String>,
}

impl RecordPatch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persisted role (and its permissions).
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Replace the override.
    pub fn set_override(mut self, role_override: RoleOverride) -> Self {
        self.role_override = OverridePatch::Set(role_override);
        self
    }

    /// Delete the override.
    pub fn clear_override(mut self) -> Self {
        self.role_override = OverridePatch::Clear;
        self
    }

    /// Set the email copy kept on the record.
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the display-name copy kept on the record.
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// The single write that starts or replaces an impersonation.
    pub fn switch(role_override: RoleOverride) -> Self {
        Self::new()
            .role(role_override.current_role)
            .set_override(role_override)
    }

    /// The single write that ends an impersonation.
    pub fn restore(original_role: Role) -> Self {
        Self::new().role(original_role).clear_override()
    }

    /// Merge into an existing record, or create one.
    ///
    /// A record created from a patch without a role starts as `guest`.
    pub fn apply(self, uid: &str, existing: Option<UserRecord>, now: DateTime<Utc>) -> UserRecord {
        let mut record = existing.unwrap_or_else(|| UserRecord::new(uid, Role::Guest, now));

        if let Some(role) = self.role {
            record.role = role;
            record.permissions = derive_permissions(role);
        }
        match self.role_override {
            OverridePatch::Keep => {}
            OverridePatch::Set(role_override) => record.role_override = Some(role_override),
            OverridePatch::Clear => record.role_override = None,
        }
        if let Some(email) = self.email {
            record.email = Some(email);
        }
        if let Some(display_name) = self.display_name {
            record.display_name = Some(display_name);
        }
        record.updated_at = now;
        record
    }
}

/// The extended public profile written for provisioned superadmins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDocument {
    pub uid: String,
    pub email: String,
    pub display_name: String,
    pub headline: String,
    pub bio: String,
    pub specialties: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Review state of a creator application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
}

/// A request to publish on the marketplace as a coach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatorApplication {
    pub id: String,
    pub uid: String,
    pub email: String,
    pub display_name: String,
    pub specialties: Vec<String>,
    pub years_experience: u8,
    pub status: ApplicationStatus,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
}

impl CreatorApplication {
    /// Create an application that is approved on submission.
    pub fn pre_approved(
        uid: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            uid: uid.into(),
            email: email.into(),
            display_name: display_name.into(),
            specialties: Vec::new(),
            years_experience: 0,
            status: ApplicationStatus::Approved,
            submitted_at: now,
            reviewed_at: Some(now),
            reviewed_by: Some("system".to_string()),
        }
    }

    /// Use a fixed id, so storing the application again replaces it.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the specialties listed on the application.
    pub fn with_specialties(mut self, specialties: Vec<String>) -> Self {
        self.specialties = specialties;
        self
    }

    /// Set the years of experience listed on the application.
    pub fn with_years_experience(mut self, years: u8) -> Self {
        self.years_experience = years;
        self
    }
}

/// Notification pushed by a store after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    /// A user record was created or merged.
    User { uid: String, role: Role },
    /// A profile was upserted.
    Profile { uid: String },
    /// An application was stored.
    Application { uid: String, id: String },
}

impl RecordChange {
    /// The uid the change concerns.
    pub fn uid(&self) -> &str {
        match self {
            RecordChange::User { uid, .. }
            | RecordChange::Profile { uid }
            | RecordChange::Application { uid, .. } => uid,
        }
    }
}
