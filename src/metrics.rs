//! Metrics collection for provisioning, resolution and impersonation.

use crate::resolver::RoleSource;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for role resolution and impersonation.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct ImpersonationMetrics {
    /// Resolutions performed.
    pub resolutions: Arc<AtomicU64>,
    /// Resolutions answered from the freeze cache.
    pub frozen_resolutions: Arc<AtomicU64>,
    /// Resolutions answered from a request view parameter.
    pub view_resolutions: Arc<AtomicU64>,
    /// Superadmins provisioned.
    pub superadmins_provisioned: Arc<AtomicU64>,
    /// Records created from the known-coach directory.
    pub coaches_mapped: Arc<AtomicU64>,
    /// Records created with the default role.
    pub defaults_assigned: Arc<AtomicU64>,
    /// Provisioning attempts that failed.
    pub provisioning_failures: Arc<AtomicU64>,
    /// Switches that settled (persisted or degraded).
    pub switches: Arc<AtomicU64>,
    /// Resets that settled (persisted or degraded).
    pub resets: Arc<AtomicU64>,
    /// Writes that fell back to in-memory state.
    pub degraded_writes: Arc<AtomicU64>,
    /// Switch/reset attempts by principals that are not superadmin-class.
    pub denied_attempts: Arc<AtomicU64>,
    /// Switch/reset attempts dropped because a write was in flight.
    pub dropped_writes: Arc<AtomicU64>,
    /// Expired overrides seen during resolution.
    pub stale_overrides_seen: Arc<AtomicU64>,
    /// Expired overrides cleared by a corrective write.
    pub stale_overrides_cleared: Arc<AtomicU64>,
    /// Debounced reconciliations run by the session loop.
    pub reconciliations: Arc<AtomicU64>,
    /// Auth-resolved waits that hit the timeout.
    pub auth_timeouts: Arc<AtomicU64>,
    /// Error counts by kind.
    pub error_counts: Arc<DashMap<String, AtomicU64>>,
    /// Impersonation activity per uid.
    pub uid_activity: Arc<DashMap<String, AtomicU64>>,
}

impl ImpersonationMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolution and where its answer came from.
    pub fn record_resolution(&self, source: RoleSource) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        match source {
            RoleSource::Frozen => {
                self.frozen_resolutions.fetch_add(1, Ordering::Relaxed);
            }
            RoleSource::RequestView => {
                self.view_resolutions.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record a superadmin provisioning.
    pub fn record_superadmin_provisioned(&self) {
        self.superadmins_provisioned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a known-coach record creation.
    pub fn record_coach_mapped(&self) {
        self.coaches_mapped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a default-role record creation.
    pub fn record_default_assigned(&self) {
        self.defaults_assigned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed provisioning attempt.
    pub fn record_provisioning_failure(&self) {
        self.provisioning_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settled switch.
    pub fn record_switch(&self, uid: &str, degraded: bool) {
        self.switches.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded_writes.fetch_add(1, Ordering::Relaxed);
        }
        self.record_uid_activity(uid);
    }

    /// Record a settled reset.
    pub fn record_reset(&self, uid: &str, degraded: bool) {
        self.resets.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.degraded_writes.fetch_add(1, Ordering::Relaxed);
        }
        self.record_uid_activity(uid);
    }

    /// Record a denied switch/reset.
    pub fn record_denied(&self, uid: &str) {
        self.denied_attempts.fetch_add(1, Ordering::Relaxed);
        self.record_uid_activity(uid);
    }

    /// Record a dropped switch/reset.
    pub fn record_dropped(&self, uid: &str) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
        self.record_uid_activity(uid);
    }

    /// Record an expired override noticed while resolving.
    pub fn record_stale_seen(&self) {
        self.stale_overrides_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expired override cleared by a corrective write.
    pub fn record_stale_cleared(&self) {
        self.stale_overrides_cleared.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session reconciliation.
    pub fn record_reconciliation(&self) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an auth-resolved timeout.
    pub fn record_auth_timeout(&self) {
        self.auth_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error.
    pub fn record_error(&self, error_type: &str) {
        self.error_counts
            .entry(error_type.to_string())
            .and_modify(|count| {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .or_insert_with(|| AtomicU64::new(1));
    }

    fn record_uid_activity(&self, uid: &str) {
        self.uid_activity
            .entry(uid.to_string())
            .and_modify(|count| {
                count.fetch_add(1, Ordering::Relaxed);
            })
            .or_insert_with(|| AtomicU64::new(1));
    }

    /// Get metrics summary.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            frozen_resolutions: self.frozen_resolutions.load(Ordering::Relaxed),
            view_resolutions: self.view_resolutions.load(Ordering::Relaxed),
            superadmins_provisioned: self.superadmins_provisioned.load(Ordering::Relaxed),
            coaches_mapped: self.coaches_mapped.load(Ordering::Relaxed),
            defaults_assigned: self.defaults_assigned.load(Ordering::Relaxed),
            provisioning_failures: self.provisioning_failures.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            degraded_writes: self.degraded_writes.load(Ordering::Relaxed),
            denied_attempts: self.denied_attempts.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            stale_overrides_seen: self.stale_overrides_seen.load(Ordering::Relaxed),
            stale_overrides_cleared: self.stale_overrides_cleared.load(Ordering::Relaxed),
            reconciliations: self.reconciliations.load(Ordering::Relaxed),
            auth_timeouts: self.auth_timeouts.load(Ordering::Relaxed),
            error_counts: self
                .error_counts
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            active_impersonators: self.uid_activity.len() as u64,
        }
    }
}

/// Summary of metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub resolutions: u64,
    pub frozen_resolutions: u64,
    pub view_resolutions: u64,
    pub superadmins_provisioned: u64,
    pub coaches_mapped: u64,
    pub defaults_assigned: u64,
    pub provisioning_failures: u64,
    pub switches: u64,
    pub resets: u64,
    pub degraded_writes: u64,
    pub denied_attempts: u64,
    pub dropped_writes: u64,
    pub stale_overrides_seen: u64,
    pub stale_overrides_cleared: u64,
    pub reconciliations: u64,
    pub auth_timeouts: u64,
    pub error_counts: HashMap<String, u64>,
    pub active_impersonators: u64,
}
