//! First sign-in provisioning.
//!
//! A principal whose email is in the superadmin directory is provisioned as a
//! superadmin with a profile and a pre-approved creator application. Otherwise
//! the known-coach directory, then the default role, decide the role of a
//! newly created record. Each uid is attempted at most once per process.

#[cfg(feature = "audit")]
use log::{debug, info, warn};

use crate::{
    directory::{Directories, SuperadminTemplate},
    error::Result,
    metrics::ImpersonationMetrics,
    principal::Principal,
    record::{CreatorApplication, ProfileDocument, RecordPatch},
    role::Role,
    storage::RecordStore,
};
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;

/// Provisions superadmins listed in the superadmin directory.
pub struct SuperadminProvisioner<S>
where
    S: RecordStore,
{
    store: Arc<S>,
    directories: Arc<Directories>,
}

impl<S> SuperadminProvisioner<S>
where
    S: RecordStore,
{
    /// Create a provisioner over `store`.
    pub fn new(store: Arc<S>, directories: Arc<Directories>) -> Self {
        Self { store, directories }
    }

    /// Provision `uid` as a superadmin if `email` is in the directory.
    ///
    /// Returns `Ok(true)` when this call performed the provisioning and
    /// `Ok(false)` when there was nothing to do (email not listed, or the
    /// record already holds superadmin). The profile and application are
    /// written first and the role last, so a record only reads as superadmin
    /// once every artifact exists. Any write error is returned unchanged and
    /// leaves the role untouched.
    pub async fn provision(
        &self,
        uid: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<bool> {
        let Some(template) = self.directories.superadmin(email) else {
            #[cfg(feature = "audit")]
            debug!("'{uid}' is not in the superadmin directory");
            return Ok(false);
        };

        if let Some(existing) = self.store.get(uid).await?
            && existing.base_role() == Role::Superadmin
        {
            #[cfg(feature = "audit")]
            debug!("'{uid}' is already a superadmin, skipping provisioning");
            return Ok(false);
        }

        let name = display_name.unwrap_or(&template.display_name).to_string();
        let now = Utc::now();

        self.store
            .upsert_profile(profile_from_template(uid, email, &name, template, now))
            .await?;

        let application = CreatorApplication::pre_approved(uid, email, name.as_str(), now)
            .with_id(format!("superadmin-{uid}"))
            .with_specialties(template.specialties.clone())
            .with_years_experience(template.years_experience);
        self.store.insert_application(application).await?;

        self.store
            .merge(
                uid,
                RecordPatch::new()
                    .role(Role::Superadmin)
                    .email(email)
                    .display_name(name),
            )
            .await?;

        #[cfg(feature = "audit")]
        info!("Provisioned '{uid}' as superadmin");

        Ok(true)
    }
}

fn profile_from_template(
    uid: &str,
    email: &str,
    display_name: &str,
    template: &SuperadminTemplate,
    now: chrono::DateTime<Utc>,
) -> ProfileDocument {
    ProfileDocument {
        uid: uid.to_string(),
        email: email.to_string(),
        display_name: display_name.to_string(),
        headline: template.headline.clone(),
        bio: template.bio.clone(),
        specialties: template.specialties.clone(),
        updated_at: now,
    }
}

/// Maps known coach emails to their role.
#[derive(Debug, Clone)]
pub struct KnownCoachMapper {
    directories: Arc<Directories>,
}

impl KnownCoachMapper {
    /// Create a mapper over `directories`.
    pub fn new(directories: Arc<Directories>) -> Self {
        Self { directories }
    }

    /// Look up the role a known coach starts with.
    pub fn lookup(&self, email: &str) -> Option<Role> {
        self.directories.coach_role(email)
    }
}

/// What provisioning did for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Superadmin directory match; `provisioned_now` is false when the record
    /// was already a superadmin.
    Superadmin { provisioned_now: bool },
    /// Record created with the known-coach role.
    KnownCoach(Role),
    /// Record created with the default role.
    DefaultRole(Role),
    /// A record already existed; nothing was written.
    Existing(Role),
    /// Another task is provisioning this uid right now.
    InProgress,
    /// Provisioning failed; resolution falls back to whatever is stored.
    Failed,
}

/// Runs the provisioners at most once per uid per process.
pub struct Provisioner<S>
where
    S: RecordStore,
{
    store: Arc<S>,
    superadmins: SuperadminProvisioner<S>,
    coaches: KnownCoachMapper,
    default_role: Role,
    attempted: DashMap<String, Option<ProvisionOutcome>>,
    metrics: ImpersonationMetrics,
}

impl<S> Provisioner<S>
where
    S: RecordStore,
{
    /// Create a provisioner.
    pub fn new(
        store: Arc<S>,
        directories: Arc<Directories>,
        default_role: Role,
        metrics: ImpersonationMetrics,
    ) -> Self {
        Self {
            superadmins: SuperadminProvisioner::new(Arc::clone(&store), Arc::clone(&directories)),
            coaches: KnownCoachMapper::new(directories),
            store,
            default_role,
            attempted: DashMap::new(),
            metrics,
        }
    }

    /// Check if `uid` has been attempted in this process.
    pub fn has_attempted(&self, uid: &str) -> bool {
        self.attempted.contains_key(uid)
    }

    /// Get the outcome recorded for `uid`, if provisioning has finished.
    pub fn outcome(&self, uid: &str) -> Option<ProvisionOutcome> {
        self.attempted.get(uid).and_then(|entry| *entry)
    }

    /// Provision `principal` unless this process already tried.
    ///
    /// Repeat calls return the first outcome without touching the store.
    pub async fn ensure(&self, principal: &Principal) -> ProvisionOutcome {
        let uid = principal.uid();
        match self.attempted.entry(uid.to_string()) {
            Entry::Occupied(entry) => return entry.get().unwrap_or(ProvisionOutcome::InProgress),
            Entry::Vacant(entry) => {
                entry.insert(None);
            }
        }

        let outcome = self.run(principal).await;
        self.attempted.insert(uid.to_string(), Some(outcome));
        outcome
    }

    async fn run(&self, principal: &Principal) -> ProvisionOutcome {
        let uid = principal.uid();
        let email = principal.email();

        if self.superadmins.directories.is_superadmin(email) {
            return match self
                .superadmins
                .provision(uid, email, principal.display_name())
                .await
            {
                Ok(provisioned_now) => {
                    if provisioned_now {
                        self.metrics.record_superadmin_provisioned();
                    }
                    ProvisionOutcome::Superadmin { provisioned_now }
                }
                Err(e) => {
                    #[cfg(feature = "audit")]
                    warn!("Superadmin provisioning for '{uid}' failed: {e}");
                    self.metrics.record_provisioning_failure();
                    self.metrics.record_error(e.kind());
                    self.fall_back_to_default(principal).await;
                    ProvisionOutcome::Failed
                }
            };
        }

        let existing = match self.store.get(uid).await {
            Ok(existing) => existing,
            Err(e) => {
                #[cfg(feature = "audit")]
                warn!("Could not read record for '{uid}': {e}");
                self.metrics.record_provisioning_failure();
                self.metrics.record_error(e.kind());
                return ProvisionOutcome::Failed;
            }
        };

        if let Some(record) = existing {
            return ProvisionOutcome::Existing(record.role);
        }

        let (role, outcome) = match self.coaches.lookup(email) {
            Some(role) => (role, ProvisionOutcome::KnownCoach(role)),
            None => (self.default_role, ProvisionOutcome::DefaultRole(self.default_role)),
        };

        match self.create_record(principal, role).await {
            Ok(()) => {
                match outcome {
                    ProvisionOutcome::KnownCoach(_) => self.metrics.record_coach_mapped(),
                    _ => self.metrics.record_default_assigned(),
                }
                #[cfg(feature = "audit")]
                info!("Created record for '{uid}' with role '{role}'");
                outcome
            }
            Err(e) => {
                #[cfg(feature = "audit")]
                warn!("Could not create record for '{uid}': {e}");
                self.metrics.record_provisioning_failure();
                self.metrics.record_error(e.kind());
                ProvisionOutcome::Failed
            }
        }
    }

    /// Give a brand-new record the default role after superadmin
    /// provisioning failed. Existing records are left alone.
    async fn fall_back_to_default(&self, principal: &Principal) {
        let uid = principal.uid();
        let created = match self.store.get(uid).await {
            Ok(Some(_)) => return,
            Ok(None) => self.create_record(principal, self.default_role).await,
            Err(e) => Err(e),
        };

        match created {
            Ok(()) => {
                self.metrics.record_default_assigned();
                #[cfg(feature = "audit")]
                info!("Fell back to role '{}' for '{uid}'", self.default_role);
            }
            Err(e) => {
                self.metrics.record_error(e.kind());
                #[cfg(feature = "audit")]
                warn!("Default role fallback for '{uid}' failed: {e}");
            }
        }
    }

    async fn create_record(&self, principal: &Principal, role: Role) -> Result<()> {
        let mut patch = RecordPatch::new().role(role).email(principal.email());
        if let Some(name) = principal.display_name() {
            patch = patch.display_name(name);
        }
        self.store.merge(principal.uid(), patch).await.map(|_| ())
    }
}
