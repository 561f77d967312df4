//! Static email directories consulted at first sign-in.
//!
//! Both directories are keyed by lower-cased email and never change after
//! construction. [`Directories::builtin`] holds the entries compiled into the
//! binary; hosts and tests can assemble their own with the `with_*` methods
//! before sharing them.

use crate::{principal::normalize_email, role::Role};
use std::collections::HashMap;

/// Template data used to provision a superadmin's profile and creator application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperadminTemplate {
    pub display_name: String,
    pub headline: String,
    pub bio: String,
    pub specialties: Vec<String>,
    pub years_experience: u8,
}

impl SuperadminTemplate {
    /// Create a template with just a display name.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            headline: String::new(),
            bio: String::new(),
            specialties: Vec::new(),
            years_experience: 0,
        }
    }

    /// Set the profile headline.
    pub fn with_headline(mut self, headline: impl Into<String>) -> Self {
        self.headline = headline.into();
        self
    }

    /// Set the profile bio.
    pub fn with_bio(mut self, bio: impl Into<String>) -> Self {
        self.bio = bio.into();
        self
    }

    /// Set the listed specialties.
    pub fn with_specialties<I, T>(mut self, specialties: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.specialties = specialties.into_iter().map(Into::into).collect();
        self
    }

    /// Set years of experience.
    pub fn with_years_experience(mut self, years: u8) -> Self {
        self.years_experience = years;
        self
    }
}

struct BuiltinSuperadmin {
    email: &'static str,
    display_name: &'static str,
    headline: &'static str,
    bio: &'static str,
    specialties: &'static [&'static str],
    years_experience: u8,
}

const BUILTIN_SUPERADMINS: &[BuiltinSuperadmin] = &[
    BuiltinSuperadmin {
        email: "founder@coachhub.example",
        display_name: "Platform Founder",
        headline: "Founder & Head Coach",
        bio: "Built the marketplace to connect athletes with great coaches.",
        specialties: &["strength", "program design", "mindset"],
        years_experience: 15,
    },
    BuiltinSuperadmin {
        email: "ops@coachhub.example",
        display_name: "Platform Operations",
        headline: "Operations Lead",
        bio: "Keeps lessons, videos and payouts running.",
        specialties: &["operations"],
        years_experience: 8,
    },
];

const BUILTIN_COACHES: &[(&str, Role)] = &[
    ("maria.lopez@coachhub.example", Role::Coach),
    ("sam.okafor@coachhub.example", Role::Coach),
    ("jordan.lee@coachhub.example", Role::AssistantCoach),
];

/// The superadmin and known-coach directories.
#[derive(Debug, Clone, Default)]
pub struct Directories {
    superadmins: HashMap<String, SuperadminTemplate>,
    coaches: HashMap<String, Role>,
}

impl Directories {
    /// Directories with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The directories compiled into the crate.
    pub fn builtin() -> Self {
        let superadmins = BUILTIN_SUPERADMINS.iter().map(|entry| {
            (
                entry.email,
                SuperadminTemplate::new(entry.display_name)
                    .with_headline(entry.headline)
                    .with_bio(entry.bio)
                    .with_specialties(entry.specialties.iter().copied())
                    .with_years_experience(entry.years_experience),
            )
        });

        let directories = superadmins.fold(Self::empty(), |dirs, (email, template)| {
            dirs.with_superadmin(email, template)
        });

        BUILTIN_COACHES
            .iter()
            .fold(directories, |dirs, (email, role)| dirs.with_coach(*email, *role))
    }

    /// Add a superadmin entry.
    pub fn with_superadmin(mut self, email: &str, template: SuperadminTemplate) -> Self {
        self.superadmins.insert(normalize_email(email), template);
        self
    }

    /// Add a known-coach entry.
    pub fn with_coach(mut self, email: &str, role: Role) -> Self {
        self.coaches.insert(normalize_email(email), role);
        self
    }

    /// Look up a superadmin template by email (case-insensitive).
    pub fn superadmin(&self, email: &str) -> Option<&SuperadminTemplate> {
        self.superadmins.get(&normalize_email(email))
    }

    /// Look up a known coach's role by email (case-insensitive).
    pub fn coach_role(&self, email: &str) -> Option<Role> {
        self.coaches.get(&normalize_email(email)).copied()
    }

    /// Check if `email` is in the superadmin directory.
    pub fn is_superadmin(&self, email: &str) -> bool {
        self.superadmin(email).is_some()
    }

    /// Number of (superadmin, coach) entries.
    pub fn len(&self) -> (usize, usize) {
        (self.superadmins.len(), self.coaches.len())
    }
}
