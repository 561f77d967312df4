//! Superadmin role impersonation.
//!
//! Each uid moves through an explicit state machine:
//!
//! ```text
//! Idle ──switch──▶ Switching ──settled──▶ Active ──reset──▶ Resetting ──settled──▶ Idle
//!                                          │  ▲
//!                                          └──┘ switch (replaces the override)
//! Active ──expired at load──▶ Idle
//! ```
//!
//! `Switching` and `Resetting` mean a write is in flight. A second switch or
//! reset for the same uid in that window is dropped, not queued. Writes that
//! fail leave the change in process memory only ([`Persistence::Degraded`]).

#[cfg(feature = "audit")]
use log::{info, warn};

use crate::{
    core::RoleServiceConfig,
    error::Result,
    freeze::FreezeRegistry,
    metrics::ImpersonationMetrics,
    principal::Principal,
    record::{RecordPatch, UserRecord},
    role::{Role, RoleOverride},
    session::TokenSource,
    storage::RecordStore,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, time::Instant};

const SETTLED_CHANNEL_CAPACITY: usize = 64;

/// Impersonation lifecycle state for one uid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ImpersonationState {
    /// No override in effect.
    #[default]
    Idle,
    /// A switch write is in flight.
    Switching,
    /// An override is in effect.
    Active,
    /// A reset write is in flight.
    Resetting,
}

impl ImpersonationState {
    /// Check if a write is in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ImpersonationState::Switching | ImpersonationState::Resetting)
    }
}

/// Whether a settled change reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Persistence {
    /// Written to the store.
    Persisted,
    /// Held in this process only; lost on reload.
    Degraded,
}

/// The override as this process currently sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOverride {
    /// An override is in effect.
    Active {
        role_override: RoleOverride,
        persistence: Persistence,
    },
    /// A reset that could not be written; the store still holds an override
    /// this process ignores.
    Restored { original_role: Role },
}

/// What a switch or reset call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpersonationOutcome {
    /// The override was created or replaced.
    Switched {
        role_override: RoleOverride,
        persistence: Persistence,
    },
    /// The override was cleared and the original role restored.
    Reset {
        restored: Role,
        persistence: Persistence,
    },
    /// The caller is not superadmin-class. Nothing was written.
    Denied,
    /// Another write for this uid was in flight. Nothing was written.
    Dropped,
    /// Reset was requested with no override to clear. Nothing was written.
    NoOverride,
}

impl ImpersonationOutcome {
    /// Check if the call changed the effective role.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            ImpersonationOutcome::Switched { .. } | ImpersonationOutcome::Reset { .. }
        )
    }

    /// Get the persistence of an applied change.
    pub fn persistence(&self) -> Option<Persistence> {
        match self {
            ImpersonationOutcome::Switched { persistence, .. }
            | ImpersonationOutcome::Reset { persistence, .. } => Some(*persistence),
            _ => None,
        }
    }
}

/// Snapshot of one uid's impersonation state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpersonationStatus {
    pub state: ImpersonationState,
    pub local: Option<LocalOverride>,
    /// Bumped every time a switch or reset settles.
    pub generation: u64,
}

impl ImpersonationStatus {
    /// Get the override in effect, if any.
    pub fn active_override(&self) -> Option<&RoleOverride> {
        match &self.local {
            Some(LocalOverride::Active { role_override, .. }) => Some(role_override),
            _ => None,
        }
    }
}

/// Published every time a switch or reset settles, persisted or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledChange {
    pub uid: String,
    pub generation: u64,
    pub persistence: Persistence,
}

/// Owns switch/reset/load for every uid in this process.
pub struct ImpersonationManager<S>
where
    S: RecordStore,
{
    store: Arc<S>,
    freeze: Arc<FreezeRegistry>,
    metrics: ImpersonationMetrics,
    token_source: Option<Arc<dyn TokenSource>>,
    override_ttl: Duration,
    freeze_window: Duration,
    slots: DashMap<String, ImpersonationStatus>,
    settled: broadcast::Sender<SettledChange>,
}

impl<S> ImpersonationManager<S>
where
    S: RecordStore,
{
    /// Create a manager.
    pub fn new(
        store: Arc<S>,
        config: &RoleServiceConfig,
        freeze: Arc<FreezeRegistry>,
        metrics: ImpersonationMetrics,
    ) -> Self {
        Self {
            store,
            freeze,
            metrics,
            token_source: None,
            override_ttl: config.override_ttl,
            freeze_window: config.freeze_window,
            slots: DashMap::new(),
            settled: broadcast::channel(SETTLED_CHANNEL_CAPACITY).0,
        }
    }

    /// Refresh the session token through `token_source` before every write.
    pub fn with_token_source(mut self, token_source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(token_source);
        self
    }

    /// Subscribe to settled switches and resets.
    ///
    /// Degraded changes never reach the store's change feed, so this is the
    /// only notification they produce.
    pub fn subscribe(&self) -> broadcast::Receiver<SettledChange> {
        self.settled.subscribe()
    }

    /// Get the current status for `uid`.
    pub fn status(&self, uid: &str) -> ImpersonationStatus {
        self.slots
            .get(uid)
            .map(|slot| slot.clone())
            .unwrap_or_default()
    }

    /// Switch the invoking superadmin into `target`.
    ///
    /// `original_role` is taken from the persisted record, so switching twice
    /// keeps the role captured before the first switch. The role and the
    /// override land in one merge.
    pub async fn switch_to_role(&self, invoker: &Principal, target: Role) -> ImpersonationOutcome {
        let uid = invoker.uid();
        let Some(previous) = self.begin(uid, ImpersonationState::Switching) else {
            return self.dropped(uid, "switch");
        };

        let Some(record) = self.authorized_record(uid, "switch roles").await else {
            self.abort(uid, previous);
            return ImpersonationOutcome::Denied;
        };

        let role_override = RoleOverride::new(record.base_role(), target, Utc::now());
        self.freeze.freeze(uid, target, self.freeze_window, Instant::now());

        let persistence = self
            .write(uid, RecordPatch::switch(role_override.clone()))
            .await;

        self.settle(
            uid,
            ImpersonationState::Active,
            Some(LocalOverride::Active {
                role_override: role_override.clone(),
                persistence,
            }),
            persistence,
        );
        self.metrics
            .record_switch(uid, persistence == Persistence::Degraded);

        #[cfg(feature = "audit")]
        info!(
            "'{uid}' switched to '{target}' (original '{}', {persistence:?})",
            role_override.original_role
        );

        ImpersonationOutcome::Switched {
            role_override,
            persistence,
        }
    }

    /// Clear the invoking superadmin's override and restore their original role.
    pub async fn reset_to_original_role(&self, invoker: &Principal) -> ImpersonationOutcome {
        let uid = invoker.uid();
        let Some(previous) = self.begin(uid, ImpersonationState::Resetting) else {
            return self.dropped(uid, "reset");
        };

        let Some(record) = self.authorized_record(uid, "reset roles").await else {
            self.abort(uid, previous);
            return ImpersonationOutcome::Denied;
        };

        let persisted_original = record.role_override.as_ref().map(|o| o.original_role);
        let local_original = match &previous.local {
            Some(LocalOverride::Active { role_override, .. }) => Some(role_override.original_role),
            _ => None,
        };
        let Some(original_role) = persisted_original.or(local_original) else {
            self.abort(uid, previous);
            return ImpersonationOutcome::NoOverride;
        };

        self.freeze
            .freeze(uid, original_role, self.freeze_window, Instant::now());

        let persistence = self.write(uid, RecordPatch::restore(original_role)).await;

        let local = match persistence {
            Persistence::Persisted => None,
            Persistence::Degraded => Some(LocalOverride::Restored { original_role }),
        };
        self.settle(uid, ImpersonationState::Idle, local, persistence);
        self.metrics
            .record_reset(uid, persistence == Persistence::Degraded);

        #[cfg(feature = "audit")]
        info!("'{uid}' reset to '{original_role}' ({persistence:?})");

        ImpersonationOutcome::Reset {
            restored: original_role,
            persistence,
        }
    }

    /// Restore a persisted override at session start.
    ///
    /// An expired override is cleared with one corrective write that also
    /// restores the original role. Returns the override now in effect.
    pub async fn load_persisted_override(&self, principal: &Principal) -> Result<Option<RoleOverride>> {
        let uid = principal.uid();
        let current = self.status(uid);
        if current.state.is_in_flight() {
            return Ok(current.active_override().cloned());
        }

        let Some(record) = self.store.get(uid).await? else {
            return Ok(None);
        };
        if !record.base_role().is_superadmin_class() {
            return Ok(None);
        }

        let now = Utc::now();
        match record.role_override {
            None => {
                self.set(uid, ImpersonationState::Idle, None);
                Ok(None)
            }
            Some(role_override) if role_override.is_expired(now, self.override_ttl) => {
                self.clear_stale(uid, &role_override).await;
                Ok(None)
            }
            Some(role_override) if !role_override.is_testing_mode => {
                self.set(uid, ImpersonationState::Idle, None);
                Ok(None)
            }
            Some(role_override) => {
                self.set(
                    uid,
                    ImpersonationState::Active,
                    Some(LocalOverride::Active {
                        role_override: role_override.clone(),
                        persistence: Persistence::Persisted,
                    }),
                );
                Ok(Some(role_override))
            }
        }
    }

    /// Overlay this process's degraded changes on a stored record.
    ///
    /// Persisted changes are already in the record and are left alone.
    pub fn local_view(
        &self,
        uid: &str,
        record: Option<UserRecord>,
        now: DateTime<Utc>,
    ) -> Option<UserRecord> {
        let status = self.status(uid);
        match status.local {
            Some(LocalOverride::Active {
                role_override,
                persistence: Persistence::Degraded,
            }) => Some(RecordPatch::switch(role_override).apply(uid, record, now)),
            Some(LocalOverride::Restored { original_role }) => {
                Some(RecordPatch::restore(original_role).apply(uid, record, now))
            }
            _ => record,
        }
    }

    /// Drop in-process state for `uid` unless a write is in flight.
    pub fn forget(&self, uid: &str) {
        self.slots.remove_if(uid, |_, slot| !slot.state.is_in_flight());
    }

    async fn clear_stale(&self, uid: &str, role_override: &RoleOverride) {
        let original_role = role_override.original_role;
        let local = match self.store.merge(uid, RecordPatch::restore(original_role)).await {
            Ok(_) => {
                self.metrics.record_stale_cleared();
                #[cfg(feature = "audit")]
                info!("Cleared expired override for '{uid}', restored '{original_role}'");
                None
            }
            Err(e) => {
                self.metrics.record_error(e.kind());
                #[cfg(feature = "audit")]
                warn!("Could not clear expired override for '{uid}': {e}");
                Some(LocalOverride::Restored { original_role })
            }
        };
        self.set(uid, ImpersonationState::Idle, local);
    }

    /// Read the record and check its base role, or record a denial.
    async fn authorized_record(&self, uid: &str, operation: &str) -> Option<UserRecord> {
        let record = match self.store.get(uid).await {
            Ok(record) => record,
            Err(e) => {
                self.metrics.record_error(e.kind());
                #[cfg(feature = "audit")]
                warn!("Could not read record for '{uid}' to {operation}: {e}");
                None
            }
        };

        match record {
            Some(record) if record.base_role().is_superadmin_class() => Some(record),
            _ => {
                self.metrics.record_denied(uid);
                #[cfg(feature = "audit")]
                warn!("Permission denied: '{uid}' may not {operation}");
                #[cfg(not(feature = "audit"))]
                let _ = operation;
                None
            }
        }
    }

    async fn write(&self, uid: &str, patch: RecordPatch) -> Persistence {
        if let Some(token_source) = &self.token_source
            && let Err(e) = token_source.fresh_token().await
        {
            self.metrics.record_error(e.kind());
            #[cfg(feature = "audit")]
            warn!("Token refresh for '{uid}' failed, keeping change in memory only: {e}");
            return Persistence::Degraded;
        }

        match self.store.merge(uid, patch).await {
            Ok(_) => Persistence::Persisted,
            Err(e) => {
                self.metrics.record_error(e.kind());
                #[cfg(feature = "audit")]
                warn!("Write for '{uid}' failed, keeping change in memory only: {e}");
                Persistence::Degraded
            }
        }
    }

    /// Claim the uid for a write. Returns the prior status, or `None` if a
    /// write is already in flight.
    fn begin(&self, uid: &str, next: ImpersonationState) -> Option<ImpersonationStatus> {
        let mut slot = self.slots.entry(uid.to_string()).or_default();
        if slot.state.is_in_flight() {
            return None;
        }
        let previous = slot.clone();
        slot.state = next;
        Some(previous)
    }

    fn abort(&self, uid: &str, previous: ImpersonationStatus) {
        self.slots.insert(uid.to_string(), previous);
    }

    fn settle(
        &self,
        uid: &str,
        state: ImpersonationState,
        local: Option<LocalOverride>,
        persistence: Persistence,
    ) {
        let generation = {
            let mut slot = self.slots.entry(uid.to_string()).or_default();
            slot.state = state;
            slot.local = local;
            slot.generation += 1;
            slot.generation
        };
        // No subscribers is fine.
        let _ = self.settled.send(SettledChange {
            uid: uid.to_string(),
            generation,
            persistence,
        });
    }

    fn set(&self, uid: &str, state: ImpersonationState, local: Option<LocalOverride>) {
        let mut slot = self.slots.entry(uid.to_string()).or_default();
        slot.state = state;
        slot.local = local;
    }

    fn dropped(&self, uid: &str, operation: &str) -> ImpersonationOutcome {
        self.metrics.record_dropped(uid);
        #[cfg(feature = "audit")]
        warn!("Dropped {operation} for '{uid}': another write is in flight");
        #[cfg(not(feature = "audit"))]
        let _ = operation;
        ImpersonationOutcome::Dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRecordStore;

    fn superadmin() -> Principal {
        Principal::new("sa", "boss@example.com")
    }

    fn setup() -> (MemoryRecordStore, ImpersonationManager<MemoryRecordStore>, Arc<FreezeRegistry>) {
        let store = MemoryRecordStore::new();
        store.seed(UserRecord::new("sa", Role::Superadmin, Utc::now()));
        store.seed(UserRecord::new("u1", Role::User, Utc::now()));
        let freeze = Arc::new(FreezeRegistry::new());
        let manager = ImpersonationManager::new(
            Arc::new(store.clone()),
            &RoleServiceConfig::default(),
            Arc::clone(&freeze),
            ImpersonationMetrics::new(),
        );
        (store, manager, freeze)
    }

    #[tokio::test]
    async fn test_switch_writes_role_and_override_in_one_merge() {
        let (store, manager, _) = setup();

        let outcome = manager.switch_to_role(&superadmin(), Role::Coach).await;
        let ImpersonationOutcome::Switched { role_override, persistence } = outcome else {
            panic!("expected a switch, got {outcome:?}");
        };
        assert_eq!(persistence, Persistence::Persisted);
        assert_eq!(role_override.original_role, Role::Superadmin);
        assert_eq!(role_override.current_role, Role::Coach);
        assert!(role_override.is_testing_mode);

        assert_eq!(store.write_counts().user_merges, 1);
        let record = store.get("sa").await.unwrap().unwrap();
        assert_eq!(record.role, Role::Coach);
        assert!(record.permissions_consistent());
        assert_eq!(record.role_override, Some(role_override));

        let status = manager.status("sa");
        assert_eq!(status.state, ImpersonationState::Active);
        assert_eq!(status.generation, 1);
    }

    #[tokio::test]
    async fn test_switch_sets_freeze_window() {
        let (_, manager, freeze) = setup();

        manager.switch_to_role(&superadmin(), Role::User).await;
        assert_eq!(freeze.frozen_role("sa", Instant::now()), Some(Role::User));
    }

    #[tokio::test]
    async fn test_non_superadmin_is_denied_without_writes() {
        let (store, manager, _) = setup();
        let user = Principal::new("u1", "user@example.com");

        assert_eq!(
            manager.switch_to_role(&user, Role::Admin).await,
            ImpersonationOutcome::Denied
        );
        assert_eq!(
            manager.reset_to_original_role(&user).await,
            ImpersonationOutcome::Denied
        );
        assert_eq!(store.write_counts().total(), 0);
        assert_eq!(manager.status("u1").state, ImpersonationState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_principal_is_denied() {
        let (store, manager, _) = setup();
        let ghost = Principal::new("ghost", "ghost@example.com");

        assert_eq!(
            manager.switch_to_role(&ghost, Role::Admin).await,
            ImpersonationOutcome::Denied
        );
        assert_eq!(store.write_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_repeated_switch_keeps_true_original() {
        let (store, manager, _) = setup();

        manager.switch_to_role(&superadmin(), Role::Admin).await;
        let outcome = manager.switch_to_role(&superadmin(), Role::User).await;

        let ImpersonationOutcome::Switched { role_override, .. } = outcome else {
            panic!("expected a switch, got {outcome:?}");
        };
        assert_eq!(role_override.original_role, Role::Superadmin);
        assert_eq!(store.get("sa").await.unwrap().unwrap().role, Role::User);
        assert_eq!(manager.status("sa").state, ImpersonationState::Active);
    }

    #[tokio::test]
    async fn test_reset_restores_original() {
        let (store, manager, _) = setup();

        manager.switch_to_role(&superadmin(), Role::User).await;
        let outcome = manager.reset_to_original_role(&superadmin()).await;
        assert_eq!(
            outcome,
            ImpersonationOutcome::Reset {
                restored: Role::Superadmin,
                persistence: Persistence::Persisted
            }
        );

        let record = store.get("sa").await.unwrap().unwrap();
        assert_eq!(record.role, Role::Superadmin);
        assert!(record.role_override.is_none());
        assert_eq!(manager.status("sa").state, ImpersonationState::Idle);
        assert_eq!(manager.status("sa").generation, 2);
    }

    #[tokio::test]
    async fn test_reset_without_override() {
        let (store, manager, _) = setup();

        assert_eq!(
            manager.reset_to_original_role(&superadmin()).await,
            ImpersonationOutcome::NoOverride
        );
        assert_eq!(store.write_counts().total(), 0);
        assert_eq!(manager.status("sa"), ImpersonationStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_switches_write_once() {
        let (store, manager, _) = setup();
        store.set_write_delay(Duration::from_millis(250));
        let principal = superadmin();

        let (first, second) = tokio::join!(
            manager.switch_to_role(&principal, Role::User),
            manager.switch_to_role(&principal, Role::Coach),
        );

        assert!(first.is_applied());
        assert_eq!(second, ImpersonationOutcome::Dropped);
        assert_eq!(store.write_counts().user_merges, 1);
        assert_eq!(store.get("sa").await.unwrap().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn test_failed_write_degrades_to_memory() {
        let (store, manager, _) = setup();
        store.fail_writes(true);

        let outcome = manager.switch_to_role(&superadmin(), Role::Coach).await;
        assert_eq!(outcome.persistence(), Some(Persistence::Degraded));

        // Store untouched, local view carries the switch.
        let stored = store.get("sa").await.unwrap();
        assert_eq!(stored.as_ref().unwrap().role, Role::Superadmin);
        let view = manager.local_view("sa", stored, Utc::now()).unwrap();
        assert_eq!(view.role, Role::Coach);
        assert_eq!(view.base_role(), Role::Superadmin);

        // Reset still works off the in-memory override.
        let outcome = manager.reset_to_original_role(&superadmin()).await;
        assert_eq!(
            outcome,
            ImpersonationOutcome::Reset {
                restored: Role::Superadmin,
                persistence: Persistence::Degraded
            }
        );
    }

    #[tokio::test]
    async fn test_settled_changes_are_published() {
        let (store, manager, _) = setup();
        let mut settled = manager.subscribe();
        store.fail_writes(true);

        manager.switch_to_role(&superadmin(), Role::Coach).await;
        assert_eq!(
            settled.try_recv().unwrap(),
            SettledChange {
                uid: "sa".to_string(),
                generation: 1,
                persistence: Persistence::Degraded,
            }
        );

        // Denied calls settle nothing.
        let user = Principal::new("u1", "user@example.com");
        assert_eq!(
            manager.switch_to_role(&user, Role::Admin).await,
            ImpersonationOutcome::Denied
        );
        assert!(settled.try_recv().is_err());

        store.fail_writes(false);
        manager.reset_to_original_role(&superadmin()).await;
        let change = settled.try_recv().unwrap();
        assert_eq!(change.generation, 2);
        assert_eq!(change.persistence, Persistence::Persisted);
    }

    #[tokio::test]
    async fn test_load_restores_active_override() {
        let (store, manager, _) = setup();
        let now = Utc::now();
        let mut record = UserRecord::new("sa", Role::Admin, now);
        record.role_override = Some(RoleOverride::new(Role::Superadmin, Role::Admin, now));
        store.seed(record);

        let loaded = manager.load_persisted_override(&superadmin()).await.unwrap();
        assert_eq!(loaded.map(|o| o.current_role), Some(Role::Admin));
        assert_eq!(manager.status("sa").state, ImpersonationState::Active);
        assert_eq!(store.write_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_load_clears_expired_override_with_one_write() {
        let (store, manager, _) = setup();
        let now = Utc::now();
        let mut record = UserRecord::new("sa", Role::User, now);
        record.role_override = Some(RoleOverride::new(
            Role::Superadmin,
            Role::User,
            now - chrono::Duration::days(9),
        ));
        store.seed(record);

        assert!(manager.load_persisted_override(&superadmin()).await.unwrap().is_none());
        assert_eq!(store.write_counts().user_merges, 1);

        let record = store.get("sa").await.unwrap().unwrap();
        assert_eq!(record.role, Role::Superadmin);
        assert!(record.role_override.is_none());
        assert_eq!(manager.status("sa").state, ImpersonationState::Idle);
    }

    #[tokio::test]
    async fn test_load_ignores_non_superadmins() {
        let (store, manager, _) = setup();
        let user = Principal::new("u1", "user@example.com");

        assert!(manager.load_persisted_override(&user).await.unwrap().is_none());
        assert_eq!(store.write_counts().total(), 0);
    }

    #[test]
    fn test_in_flight_states() {
        assert!(ImpersonationState::Switching.is_in_flight());
        assert!(ImpersonationState::Resetting.is_in_flight());
        assert!(!ImpersonationState::Idle.is_in_flight());
        assert!(!ImpersonationState::Active.is_in_flight());
    }
}
