//! Capabilities and the role → capability mapping.
//!
//! Capability sets are always derived from a role at read time. The set stored
//! on a [`UserRecord`](crate::record::UserRecord) mirrors the persisted role
//! and is never consulted for the effective role.

use crate::{
    error::{Error, Result},
    role::Role,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A single thing a principal is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Browse public lessons and coach profiles.
    ViewPublicContent,
    /// Watch member-only videos and lessons.
    ViewMemberContent,
    /// Edit one's own profile.
    EditOwnProfile,
    /// Generate lesson drafts.
    GenerateLessons,
    /// Upload videos and files.
    UploadMedia,
    /// Create, edit and publish one's own lessons and videos.
    ManageOwnContent,
    /// Work with a coach's client roster.
    ManageCoachingClients,
    /// See engagement analytics.
    ViewAnalytics,
    /// Hide or remove other people's content.
    ModerateContent,
    /// Review creator applications.
    ReviewApplications,
    /// Edit other users' records.
    ManageUsers,
    /// Change other users' roles.
    ManageRoles,
    /// Switch into other roles for testing.
    Impersonate,
    /// Platform-level settings.
    ManageSystem,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 14] = [
        Capability::ViewPublicContent,
        Capability::ViewMemberContent,
        Capability::EditOwnProfile,
        Capability::GenerateLessons,
        Capability::UploadMedia,
        Capability::ManageOwnContent,
        Capability::ManageCoachingClients,
        Capability::ViewAnalytics,
        Capability::ModerateContent,
        Capability::ReviewApplications,
        Capability::ManageUsers,
        Capability::ManageRoles,
        Capability::Impersonate,
        Capability::ManageSystem,
    ];

    /// Get the string representation of the capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ViewPublicContent => "view_public_content",
            Capability::ViewMemberContent => "view_member_content",
            Capability::EditOwnProfile => "edit_own_profile",
            Capability::GenerateLessons => "generate_lessons",
            Capability::UploadMedia => "upload_media",
            Capability::ManageOwnContent => "manage_own_content",
            Capability::ManageCoachingClients => "manage_coaching_clients",
            Capability::ViewAnalytics => "view_analytics",
            Capability::ModerateContent => "moderate_content",
            Capability::ReviewApplications => "review_applications",
            Capability::ManageUsers => "manage_users",
            Capability::ManageRoles => "manage_roles",
            Capability::Impersonate => "impersonate",
            Capability::ManageSystem => "manage_system",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| Error::InvalidConfiguration(format!("Unknown capability: '{s}'")))
    }
}

/// A collection of capabilities with utility methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Check if the set grants a capability.
    pub fn contains(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Get the number of capabilities in the set.
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if the capability set is empty.
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Check whether every capability here is also in `other`.
    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        self.capabilities.is_subset(&other.capabilities)
    }

    /// Iterate the capabilities in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

impl From<&[Capability]> for CapabilitySet {
    fn from(capabilities: &[Capability]) -> Self {
        capabilities.iter().copied().collect()
    }
}

impl IntoIterator for CapabilitySet {
    type Item = Capability;
    type IntoIter = std::collections::btree_set::IntoIter<Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.capabilities.into_iter()
    }
}

const GUEST: &[Capability] = &[Capability::ViewPublicContent];

const USER: &[Capability] = &[
    Capability::ViewPublicContent,
    Capability::ViewMemberContent,
    Capability::EditOwnProfile,
];

const ASSISTANT_COACH: &[Capability] = &[
    Capability::ViewPublicContent,
    Capability::ViewMemberContent,
    Capability::EditOwnProfile,
    Capability::GenerateLessons,
    Capability::UploadMedia,
    Capability::ManageCoachingClients,
];

const COACH: &[Capability] = &[
    Capability::ViewPublicContent,
    Capability::ViewMemberContent,
    Capability::EditOwnProfile,
    Capability::GenerateLessons,
    Capability::UploadMedia,
    Capability::ManageOwnContent,
    Capability::ManageCoachingClients,
    Capability::ViewAnalytics,
];

const ADMIN: &[Capability] = &[
    Capability::ViewPublicContent,
    Capability::ViewMemberContent,
    Capability::EditOwnProfile,
    Capability::GenerateLessons,
    Capability::UploadMedia,
    Capability::ManageOwnContent,
    Capability::ManageCoachingClients,
    Capability::ViewAnalytics,
    Capability::ModerateContent,
    Capability::ReviewApplications,
    Capability::ManageUsers,
];

/// Map a role to its capability set.
///
/// Total over [`Role`]: every role, `guest` included, has an explicit set.
pub fn derive_permissions(role: Role) -> CapabilitySet {
    match role {
        Role::Guest => GUEST.into(),
        Role::User => USER.into(),
        Role::AssistantCoach => ASSISTANT_COACH.into(),
        Role::Coach => COACH.into(),
        Role::Admin => ADMIN.into(),
        Role::Superadmin => Capability::ALL.as_slice().into(),
    }
}
