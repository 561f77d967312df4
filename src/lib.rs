//! # Role Impersonation
//!
//! Effective-role resolution and superadmin impersonation for a coaching
//! marketplace.
//!
//! ## Features
//!
//! - Fixed role ladder from `guest` to `superadmin` with derived capabilities
//! - First sign-in provisioning from superadmin and known-coach directories
//! - Pure effective-role resolution with provenance
//! - Persisted impersonation overrides with a 7-day TTL
//! - Per-request "view as" parameter that is never written anywhere
//! - Single-writer guard, freeze window and debounced session reconciliation
//! - In-memory fallback when a write cannot be persisted
//!
//! ## Quick Start
//!
//! ```rust
//! use role_impersonation::{Capability, Principal, Role, RoleService};
//!
//! # tokio_test_block_on(async {
//! let service = RoleService::in_memory();
//! let founder = Principal::new("uid-1", "founder@coachhub.example");
//!
//! // Provision on first sign-in.
//! service.sign_in(&founder).await;
//! assert_eq!(service.effective_role(Some(&founder), None).await, Role::Superadmin);
//!
//! // Look at the product as a coach would.
//! let outcome = service.switch_to_role(&founder, Role::Coach).await;
//! assert!(outcome.is_applied());
//! assert!(!service.can(Some(&founder), None, Capability::ManageRoles).await);
//!
//! // And back.
//! service.reset_to_original_role(&founder).await;
//! assert_eq!(service.effective_role(Some(&founder), None).await, Role::Superadmin);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! ## Audit Logging
//!
//! When the `audit` feature is enabled, provisioning, impersonation and
//! session events are logged through the `log` facade:
//!
//! ```rust
//! use role_impersonation::init_audit_logger;
//!
//! // Initialize logging (must be called early in program execution)
//! init_audit_logger();
//!
//! // Configure log level through RUST_LOG environment variable:
//! // RUST_LOG=info,role_impersonation=debug
//! ```
//!
//! The following events are logged:
//! - Provisioning performed, skipped or failed
//! - Switches and resets, and writes kept in memory only (warn)
//! - Permission-denied and dropped impersonation attempts (warn)
//! - Expired overrides cleared at sign-in
//! - Session auth timeouts (warn)
//! - Resolution decisions (at debug level)

#[cfg(feature = "audit")]
pub fn init_audit_logger() {
    env_logger::init();
}

pub mod core;
pub mod directory;
pub mod error;
pub mod freeze;
pub mod impersonation;
pub mod metrics;
pub mod permission;
pub mod principal;
pub mod provision;
pub mod record;
pub mod resolver;
pub mod role;
pub mod session;
pub mod storage;

// Re-export main types for convenience
pub use crate::{
    core::{RoleService, RoleServiceBuilder, RoleServiceConfig},
    directory::{Directories, SuperadminTemplate},
    error::{Error, Result},
    freeze::FreezeRegistry,
    impersonation::{
        ImpersonationManager, ImpersonationOutcome, ImpersonationState, ImpersonationStatus,
        LocalOverride, Persistence, SettledChange,
    },
    metrics::{ImpersonationMetrics, MetricsSummary},
    permission::{derive_permissions, Capability, CapabilitySet},
    principal::Principal,
    provision::{KnownCoachMapper, ProvisionOutcome, Provisioner, SuperadminProvisioner},
    record::{
        ApplicationStatus, CreatorApplication, ProfileDocument, RecordChange, RecordPatch,
        UserRecord,
    },
    resolver::{Resolution, RoleResolver, RoleSource, RoleView},
    role::{Role, RoleOverride},
    session::{IdentityEvent, RoleSession, SessionSnapshot, TokenSource},
    storage::{Collection, MemoryRecordStore, RecordStore, WriteCounts},
};

#[cfg(feature = "persistence")]
pub use crate::storage::file_storage::FileRecordStore;
