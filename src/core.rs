//! Core role service implementation.

#[cfg(feature = "audit")]
use log::{debug, warn};

use crate::{
    directory::Directories,
    error::{Error, Result},
    freeze::FreezeRegistry,
    impersonation::{ImpersonationManager, ImpersonationOutcome, ImpersonationStatus},
    metrics::ImpersonationMetrics,
    permission::{derive_permissions, Capability, CapabilitySet},
    principal::Principal,
    provision::{ProvisionOutcome, Provisioner},
    record::UserRecord,
    resolver::{Resolution, RoleResolver, RoleView},
    role::{Role, RoleOverride},
    session::TokenSource,
    storage::{MemoryRecordStore, RecordStore},
};
use chrono::Utc;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// Configuration for the role service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleServiceConfig {
    /// How long a persisted override stays in effect after it was created.
    pub override_ttl: Duration,
    /// How long resolution is pinned to the target role after a switch or reset.
    pub freeze_window: Duration,
    /// Quiet period before a burst of identity/record changes is reconciled.
    pub debounce_window: Duration,
    /// Upper bound on waiting for a session to resolve.
    pub auth_timeout: Duration,
    /// Role given to new records that match no directory.
    pub default_role: Role,
    /// Query-string key of the per-request role view.
    pub role_view_param: String,
}

impl Default for RoleServiceConfig {
    fn default() -> Self {
        Self {
            override_ttl: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
            freeze_window: Duration::from_secs(2),
            debounce_window: Duration::from_millis(100),
            auth_timeout: Duration::from_secs(5),
            default_role: Role::User,
            role_view_param: "viewAs".to_string(),
        }
    }
}

impl RoleServiceConfig {
    /// Check the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.override_ttl.is_zero() {
            return Err(Error::InvalidConfiguration(
                "override_ttl must be greater than zero".to_string(),
            ));
        }
        if self.auth_timeout.is_zero() {
            return Err(Error::InvalidConfiguration(
                "auth_timeout must be greater than zero".to_string(),
            ));
        }
        if self.default_role > Role::User {
            return Err(Error::InvalidConfiguration(format!(
                "default_role '{}' grants more than '{}'",
                self.default_role,
                Role::User
            )));
        }
        if self.role_view_param.trim().is_empty() {
            return Err(Error::InvalidConfiguration(
                "role_view_param must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`RoleService`].
///
/// # Example
/// ```rust
/// use role_impersonation::{RoleService, MemoryRecordStore};
/// use std::time::Duration;
///
/// let service = RoleService::builder()
///     .freeze_window(Duration::from_secs(1))
///     .role_view_param("as")
///     .build(MemoryRecordStore::new())
///     .unwrap();
/// assert_eq!(service.config().role_view_param, "as");
/// ```
pub struct RoleServiceBuilder {
    config: RoleServiceConfig,
    directories: Option<Directories>,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl RoleServiceBuilder {
    /// Create a builder with the default configuration and built-in directories.
    pub fn new() -> Self {
        Self {
            config: RoleServiceConfig::default(),
            directories: None,
            token_source: None,
        }
    }

    /// Set the whole configuration.
    pub fn config(mut self, config: RoleServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the override TTL.
    pub fn override_ttl(mut self, ttl: Duration) -> Self {
        self.config.override_ttl = ttl;
        self
    }

    /// Set the freeze window.
    pub fn freeze_window(mut self, window: Duration) -> Self {
        self.config.freeze_window = window;
        self
    }

    /// Set the debounce window.
    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.config.debounce_window = window;
        self
    }

    /// Set the auth-resolved timeout.
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.config.auth_timeout = timeout;
        self
    }

    /// Set the role for new records that match no directory.
    pub fn default_role(mut self, role: Role) -> Self {
        self.config.default_role = role;
        self
    }

    /// Set the query-string key of the role view.
    pub fn role_view_param(mut self, key: impl Into<String>) -> Self {
        self.config.role_view_param = key.into();
        self
    }

    /// Use custom superadmin and coach directories.
    pub fn directories(mut self, directories: Directories) -> Self {
        self.directories = Some(directories);
        self
    }

    /// Refresh the session token before every impersonation write.
    pub fn token_source(mut self, token_source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(token_source);
        self
    }

    /// Validate the configuration and build the service over `store`.
    pub fn build<S>(self, store: S) -> Result<RoleService<S>>
    where
        S: RecordStore,
    {
        self.config.validate()?;
        let directories = self.directories.unwrap_or_else(Directories::builtin);
        let mut service = RoleService::assemble(store, self.config, directories);
        if let Some(token_source) = self.token_source {
            service.impersonation = service.impersonation.with_token_source(token_source);
        }
        Ok(service)
    }
}

impl Default for RoleServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves effective roles and runs impersonation for one process.
pub struct RoleService<S = MemoryRecordStore>
where
    S: RecordStore,
{
    store: Arc<S>,
    config: RoleServiceConfig,
    resolver: RoleResolver,
    freeze: Arc<FreezeRegistry>,
    provisioner: Provisioner<S>,
    impersonation: ImpersonationManager<S>,
    metrics: ImpersonationMetrics,
    // uids whose persisted override was loaded in this process
    overrides_loaded: DashSet<String>,
}

impl RoleService<MemoryRecordStore> {
    /// Create a service over an empty in-memory store.
    pub fn in_memory() -> Self {
        Self::new(MemoryRecordStore::new())
    }

    /// Create a builder. The store type is chosen at [`RoleServiceBuilder::build`].
    pub fn builder() -> RoleServiceBuilder {
        RoleServiceBuilder::new()
    }
}

impl<S> RoleService<S>
where
    S: RecordStore,
{
    /// Create a service with the default configuration and built-in directories.
    pub fn new(store: S) -> Self {
        Self::assemble(store, RoleServiceConfig::default(), Directories::builtin())
    }

    fn assemble(store: S, config: RoleServiceConfig, directories: Directories) -> Self {
        let store = Arc::new(store);
        let metrics = ImpersonationMetrics::new();
        let freeze = Arc::new(FreezeRegistry::new());

        Self {
            resolver: RoleResolver::new(config.override_ttl),
            provisioner: Provisioner::new(
                Arc::clone(&store),
                Arc::new(directories),
                config.default_role,
                metrics.clone(),
            ),
            impersonation: ImpersonationManager::new(
                Arc::clone(&store),
                &config,
                Arc::clone(&freeze),
                metrics.clone(),
            ),
            store,
            config,
            freeze,
            metrics,
            overrides_loaded: DashSet::new(),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RoleServiceConfig {
        &self.config
    }

    /// Get the record store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the metrics collector.
    pub fn metrics(&self) -> &ImpersonationMetrics {
        &self.metrics
    }

    /// Get the freeze registry.
    pub fn freeze(&self) -> &FreezeRegistry {
        &self.freeze
    }

    /// Get the provisioner.
    pub fn provisioner(&self) -> &Provisioner<S> {
        &self.provisioner
    }

    /// Get the impersonation manager.
    pub fn impersonation(&self) -> &ImpersonationManager<S> {
        &self.impersonation
    }

    /// Handle a principal becoming authenticated.
    ///
    /// Provisions the principal (once per process) and, the first time a
    /// superadmin signs in, restores or clears their persisted override.
    pub async fn sign_in(&self, principal: &Principal) -> ProvisionOutcome {
        let outcome = self.provisioner.ensure(principal).await;

        let uid = principal.uid();
        if self.overrides_loaded.insert(uid.to_string())
            && let Err(e) = self.impersonation.load_persisted_override(principal).await
        {
            self.metrics.record_error(e.kind());
            #[cfg(feature = "audit")]
            warn!("Could not load persisted override for '{uid}': {e}");
            self.overrides_loaded.remove(uid);
        }

        outcome
    }

    /// Drop process-local state for `uid`.
    pub fn sign_out(&self, uid: &str) {
        self.freeze.thaw(uid);
        self.impersonation.forget(uid);
        self.overrides_loaded.remove(uid);
    }

    /// Resolve the effective role and return the record it was resolved from.
    ///
    /// A store read failure is treated as a missing record. The returned
    /// record includes any change this process holds in memory only.
    pub async fn resolve_with_record(
        &self,
        principal: Option<&Principal>,
        view_param: Option<&str>,
    ) -> (Option<UserRecord>, Resolution) {
        let now = Utc::now();
        let Some(principal) = principal else {
            let resolution = self.resolver.resolve(None, None, view_param, None, now);
            self.metrics.record_resolution(resolution.source);
            return (None, resolution);
        };

        let uid = principal.uid();
        let stored = match self.store.get(uid).await {
            Ok(record) => record,
            Err(e) => {
                self.metrics.record_error(e.kind());
                #[cfg(feature = "audit")]
                warn!("Could not read record for '{uid}', resolving without it: {e}");
                None
            }
        };
        let record = self.impersonation.local_view(uid, stored, now);
        let frozen = self.freeze.frozen_role(uid, Instant::now());

        let resolution = self
            .resolver
            .resolve(Some(principal), record.as_ref(), view_param, frozen, now);

        if resolution.stale_override {
            self.metrics.record_stale_seen();
        }
        self.metrics.record_resolution(resolution.source);

        #[cfg(feature = "audit")]
        debug!(
            "Resolved '{uid}' to '{}' from {:?}",
            resolution.role, resolution.source
        );

        (record, resolution)
    }

    /// Resolve the effective role with its provenance.
    pub async fn resolve(&self, principal: Option<&Principal>, view_param: Option<&str>) -> Resolution {
        self.resolve_with_record(principal, view_param).await.1
    }

    /// Resolve just the effective role.
    pub async fn effective_role(&self, principal: Option<&Principal>, view_param: Option<&str>) -> Role {
        self.resolve(principal, view_param).await.role
    }

    /// Resolve the effective role, reading the role view from a raw query string.
    pub async fn effective_role_for_query(&self, principal: Option<&Principal>, query: &str) -> Role {
        let view = self.role_view(query);
        self.effective_role(principal, view.map(|v| v.role().as_str()))
            .await
    }

    /// Extract the role view from a raw query string.
    pub fn role_view(&self, query: &str) -> Option<RoleView> {
        RoleView::from_query(query, &self.config.role_view_param)
    }

    /// Get the capabilities of the effective role.
    pub async fn capabilities(
        &self,
        principal: Option<&Principal>,
        view_param: Option<&str>,
    ) -> CapabilitySet {
        derive_permissions(self.effective_role(principal, view_param).await)
    }

    /// Check a single capability against the effective role.
    pub async fn can(
        &self,
        principal: Option<&Principal>,
        view_param: Option<&str>,
        capability: Capability,
    ) -> bool {
        self.capabilities(principal, view_param)
            .await
            .contains(capability)
    }

    /// Switch the invoking superadmin into `target`.
    pub async fn switch_to_role(&self, invoker: &Principal, target: Role) -> ImpersonationOutcome {
        self.impersonation.switch_to_role(invoker, target).await
    }

    /// Restore the invoking superadmin's original role.
    pub async fn reset_to_original_role(&self, invoker: &Principal) -> ImpersonationOutcome {
        self.impersonation.reset_to_original_role(invoker).await
    }

    /// Restore or clear the principal's persisted override.
    pub async fn load_persisted_override(&self, principal: &Principal) -> Result<Option<RoleOverride>> {
        self.impersonation.load_persisted_override(principal).await
    }

    /// Get the impersonation status for `uid`.
    pub fn status(&self, uid: &str) -> ImpersonationStatus {
        self.impersonation.status(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{directory::SuperadminTemplate, resolver::RoleSource};

    fn service() -> RoleService {
        RoleService::builder()
            .directories(
                Directories::empty()
                    .with_superadmin("boss@example.com", SuperadminTemplate::new("Boss"))
                    .with_coach("coach@example.com", Role::Coach),
            )
            .build(MemoryRecordStore::new())
            .unwrap()
    }

    fn boss() -> Principal {
        Principal::new("boss", "boss@example.com")
    }

    #[test]
    fn test_default_config() {
        let config = RoleServiceConfig::default();
        assert_eq!(config.override_ttl, Duration::from_secs(604_800));
        assert_eq!(config.freeze_window, Duration::from_secs(2));
        assert_eq!(config.debounce_window, Duration::from_millis(100));
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
        assert_eq!(config.default_role, Role::User);
        assert_eq!(config.role_view_param, "viewAs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let zero_ttl = RoleService::builder()
            .override_ttl(Duration::ZERO)
            .build(MemoryRecordStore::new());
        assert!(matches!(zero_ttl, Err(Error::InvalidConfiguration(_))));

        let generous = RoleService::builder()
            .default_role(Role::Admin)
            .build(MemoryRecordStore::new());
        assert!(matches!(generous, Err(Error::InvalidConfiguration(_))));

        let blank = RoleService::builder()
            .role_view_param("  ")
            .build(MemoryRecordStore::new());
        assert!(matches!(blank, Err(Error::InvalidConfiguration(_))));

        assert!(RoleService::builder()
            .default_role(Role::Guest)
            .build(MemoryRecordStore::new())
            .is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config: RoleServiceConfig =
            serde_json::from_str(r#"{"role_view_param": "as", "default_role": "guest"}"#).unwrap();
        assert_eq!(config.role_view_param, "as");
        assert_eq!(config.default_role, Role::Guest);
        assert_eq!(config.freeze_window, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_sign_in_provisions_and_resolves() {
        let service = service();

        let outcome = service.sign_in(&boss()).await;
        assert_eq!(outcome, ProvisionOutcome::Superadmin { provisioned_now: true });
        assert_eq!(service.effective_role(Some(&boss()), None).await, Role::Superadmin);

        let coach = Principal::new("c1", "coach@example.com");
        service.sign_in(&coach).await;
        assert!(service.can(Some(&coach), None, Capability::GenerateLessons).await);
        assert!(!service.can(Some(&coach), None, Capability::ManageUsers).await);
    }

    #[tokio::test]
    async fn test_unauthenticated_and_unknown() {
        let service = service();
        assert_eq!(service.effective_role(None, Some("admin")).await, Role::Guest);

        let stranger = Principal::new("x", "x@example.com");
        let resolution = service.resolve(Some(&stranger), None).await;
        assert_eq!(resolution.role, Role::Guest);
        assert_eq!(resolution.source, RoleSource::MissingRecord);
    }

    #[tokio::test]
    async fn test_store_read_failure_resolves_as_missing_record() {
        let service = service();
        service.sign_in(&boss()).await;
        service.store().fail_reads(true);

        let resolution = service.resolve(Some(&boss()), None).await;
        assert_eq!(resolution.role, Role::Guest);
        assert_eq!(resolution.source, RoleSource::MissingRecord);
        assert_eq!(service.metrics().summary().error_counts.get("storage"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_is_frozen_then_read_from_store() {
        let service = service();
        service.sign_in(&boss()).await;

        let outcome = service.switch_to_role(&boss(), Role::User).await;
        assert!(outcome.is_applied());

        let resolution = service.resolve(Some(&boss()), None).await;
        assert_eq!(resolution.role, Role::User);
        assert_eq!(resolution.source, RoleSource::Frozen);

        tokio::time::advance(Duration::from_secs(3)).await;
        let resolution = service.resolve(Some(&boss()), None).await;
        assert_eq!(resolution.role, Role::User);
        assert_eq!(resolution.source, RoleSource::Override);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_switch_is_visible_in_process() {
        let service = service();
        service.sign_in(&boss()).await;
        service.store().fail_writes(true);

        let outcome = service.switch_to_role(&boss(), Role::Coach).await;
        assert_eq!(
            outcome.persistence(),
            Some(crate::impersonation::Persistence::Degraded)
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(service.effective_role(Some(&boss()), None).await, Role::Coach);
        assert_eq!(service.metrics().summary().degraded_writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolving_does_not_grow_freeze_state() {
        let service = service();
        for n in 0..50 {
            let member = Principal::new(format!("m{n}"), format!("m{n}@example.com"));
            service.sign_in(&member).await;
            service.effective_role(Some(&member), None).await;
        }
        assert!(service.freeze().is_empty());

        service.sign_in(&boss()).await;
        service.switch_to_role(&boss(), Role::Coach).await;
        assert_eq!(service.freeze().len(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        service.effective_role(Some(&boss()), None).await;
        assert!(service.freeze().is_empty());
    }

    #[tokio::test]
    async fn test_role_view_from_query() {
        let service = service();
        service.sign_in(&boss()).await;

        assert_eq!(
            service
                .effective_role_for_query(Some(&boss()), "?tab=lessons&viewAs=creator")
                .await,
            Role::Coach
        );
        assert_eq!(
            service.effective_role_for_query(Some(&boss()), "viewAs=nobody").await,
            Role::Superadmin
        );
        // Viewing never writes.
        assert_eq!(service.store().write_counts().user_merges, 1);
    }

    #[tokio::test]
    async fn test_sign_out_clears_local_state() {
        let service = service();
        service.sign_in(&boss()).await;
        service.switch_to_role(&boss(), Role::Admin).await;

        service.sign_out("boss");
        assert!(!service.freeze().is_frozen("boss", Instant::now()));
        assert_eq!(service.status("boss"), ImpersonationStatus::default());

        // The override is persisted, so it comes back on the next sign-in.
        service.sign_in(&boss()).await;
        assert_eq!(
            service.status("boss").active_override().map(|o| o.current_role),
            Some(Role::Admin)
        );
    }
}
