//! Session glue between the identity provider and the role service.
//!
//! A [`RoleSession`] owns a background task that listens to identity events,
//! record-change notifications and settled impersonation changes, waits for
//! a burst to go quiet, then provisions and resolves once and publishes a
//! [`SessionSnapshot`].

#[cfg(feature = "audit")]
use log::{debug, warn};

use crate::{
    core::RoleService,
    error::{Error, Result},
    metrics::ImpersonationMetrics,
    permission::{derive_permissions, Capability, CapabilitySet},
    principal::Principal,
    record::{RecordChange, UserRecord},
    resolver::RoleSource,
    role::Role,
    storage::RecordStore,
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Events delivered by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEvent {
    /// The authenticated principal changed; `None` means signed out.
    PrincipalChanged(Option<Principal>),
    /// Re-resolve the current principal without an identity change.
    Refresh,
}

/// Forces a token refresh before sensitive writes.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Get a freshly issued session token.
    async fn fresh_token(&self) -> Result<String>;
}

/// The resolved state of a session at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub principal: Option<Principal>,
    pub record: Option<UserRecord>,
    pub role: Role,
    pub source: RoleSource,
    pub capabilities: CapabilitySet,
    /// Impersonation generation of the principal when this snapshot was
    /// taken. Snapshots with a lower generation are older.
    pub generation: u64,
    /// Number of identity events this snapshot reflects.
    pub sequence: u64,
    /// True once every identity event sent so far has been reconciled.
    pub resolved: bool,
}

impl SessionSnapshot {
    /// The state before anything has been resolved.
    pub fn pending() -> Self {
        Self {
            principal: None,
            record: None,
            role: Role::Guest,
            source: RoleSource::Unauthenticated,
            capabilities: derive_permissions(Role::Guest),
            generation: 0,
            sequence: 0,
            resolved: false,
        }
    }

    /// Get the uid of the session principal.
    pub fn uid(&self) -> Option<&str> {
        self.principal.as_ref().map(Principal::uid)
    }

    /// Check a capability against the resolved role.
    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Handle to a running session task.
///
/// Dropping the handle stops the task.
pub struct RoleSession {
    events: mpsc::Sender<(u64, IdentityEvent)>,
    snapshots: Arc<watch::Sender<SessionSnapshot>>,
    issued: Arc<AtomicU64>,
    auth_timeout: Duration,
    metrics: ImpersonationMetrics,
    task: JoinHandle<()>,
}

impl RoleSession {
    /// Start a session task for `service` on the current tokio runtime.
    pub fn spawn<S>(service: Arc<RoleService<S>>) -> Self
    where
        S: RecordStore + 'static,
    {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let snapshots = Arc::new(watch::channel(SessionSnapshot::pending()).0);
        let issued = Arc::new(AtomicU64::new(0));
        let auth_timeout = service.config().auth_timeout;
        let metrics = service.metrics().clone();
        let task = tokio::spawn(run(
            service,
            events_rx,
            Arc::clone(&snapshots),
            Arc::clone(&issued),
        ));

        Self {
            events,
            snapshots,
            issued,
            auth_timeout,
            metrics,
            task,
        }
    }

    /// Report a principal change.
    ///
    /// The current snapshot reads as unresolved from the moment this returns
    /// until the new principal has been reconciled.
    pub async fn principal_changed(&self, principal: Option<Principal>) -> Result<()> {
        self.send(IdentityEvent::PrincipalChanged(principal)).await
    }

    /// Ask for a re-resolution of the current principal.
    pub async fn refresh(&self) -> Result<()> {
        self.send(IdentityEvent::Refresh).await
    }

    /// Forward one event from an identity feed.
    pub async fn send(&self, event: IdentityEvent) -> Result<()> {
        let sequence = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(event, IdentityEvent::PrincipalChanged(_)) {
            self.snapshots.send_modify(|snapshot| snapshot.resolved = false);
        }
        self.events
            .send((sequence, event))
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Get the latest snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    /// Wait until every event sent so far is reconciled, up to the
    /// configured auth timeout.
    ///
    /// On timeout the best state known so far is returned with
    /// `resolved == false`; callers proceed with it instead of blocking.
    pub async fn wait_resolved(&self) -> SessionSnapshot {
        let target = self.issued.load(Ordering::SeqCst);
        let mut snapshots = self.snapshots.subscribe();
        let reconciled = snapshots.wait_for(|s| s.resolved && s.sequence >= target);

        match time::timeout(self.auth_timeout, reconciled).await {
            Ok(Ok(snapshot)) => snapshot.clone(),
            Ok(Err(_)) => self.snapshot(),
            Err(_) => {
                self.metrics.record_auth_timeout();
                #[cfg(feature = "audit")]
                warn!(
                    "Session did not resolve within {:?}, continuing with best-known role",
                    self.auth_timeout
                );
                self.snapshot()
            }
        }
    }
}

impl Drop for RoleSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Identity state owned by the session task.
#[derive(Default)]
struct Current {
    principal: Option<Principal>,
    sequence: u64,
}

async fn run<S>(
    service: Arc<RoleService<S>>,
    mut events: mpsc::Receiver<(u64, IdentityEvent)>,
    snapshots: Arc<watch::Sender<SessionSnapshot>>,
    issued: Arc<AtomicU64>,
) where
    S: RecordStore,
{
    let mut changes = service.store().subscribe();
    let mut changes_open = true;
    let mut settled = service.impersonation().subscribe();
    let mut settled_open = true;
    let debounce = service.config().debounce_window;
    let mut current = Current::default();

    loop {
        // Wait for the first event of a burst.
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => apply(&service, &mut current, event),
                None => return,
            },
            change = changes.recv(), if changes_open => {
                changes_open = !matches!(change, Err(RecvError::Closed));
                if !concerns(change.as_ref().map(RecordChange::uid), &current) {
                    continue;
                }
            }
            change = settled.recv(), if settled_open => {
                settled_open = !matches!(change, Err(RecvError::Closed));
                if !concerns(change.as_ref().map(|c| c.uid.as_str()), &current) {
                    continue;
                }
            }
        }

        // Absorb the rest of the burst.
        let quiet = time::sleep(debounce);
        tokio::pin!(quiet);
        loop {
            tokio::select! {
                () = &mut quiet => break,
                event = events.recv() => match event {
                    Some(event) => {
                        apply(&service, &mut current, event);
                        quiet.as_mut().reset(Instant::now() + debounce);
                    }
                    None => return,
                },
                change = changes.recv(), if changes_open => {
                    changes_open = !matches!(change, Err(RecvError::Closed));
                    if concerns(change.as_ref().map(RecordChange::uid), &current) {
                        quiet.as_mut().reset(Instant::now() + debounce);
                    }
                }
                change = settled.recv(), if settled_open => {
                    settled_open = !matches!(change, Err(RecvError::Closed));
                    if concerns(change.as_ref().map(|c| c.uid.as_str()), &current) {
                        quiet.as_mut().reset(Instant::now() + debounce);
                    }
                }
            }
        }

        let snapshot = reconcile(&service, &current).await;
        snapshots.send_modify(|published| {
            // Events sent while reconciling are still queued.
            let resolved = snapshot.sequence >= issued.load(Ordering::SeqCst);
            *published = SessionSnapshot { resolved, ..snapshot };
        });
    }
}

fn apply<S>(service: &RoleService<S>, current: &mut Current, (sequence, event): (u64, IdentityEvent))
where
    S: RecordStore,
{
    current.sequence = current.sequence.max(sequence);
    let IdentityEvent::PrincipalChanged(next) = event else {
        return;
    };

    if let Some(previous) = current.principal.as_ref()
        && next.as_ref().map(Principal::uid) != Some(previous.uid())
    {
        service.sign_out(previous.uid());
    }
    current.principal = next;
}

/// Whether a notification about `uid` affects the session principal.
fn concerns(uid: std::result::Result<&str, &RecvError>, current: &Current) -> bool {
    let principal = current.principal.as_ref();
    match uid {
        Ok(uid) => principal.is_some_and(|p| p.uid() == uid),
        // Missed notifications may include ours.
        Err(RecvError::Lagged(_)) => principal.is_some(),
        Err(RecvError::Closed) => false,
    }
}

async fn reconcile<S>(service: &RoleService<S>, current: &Current) -> SessionSnapshot
where
    S: RecordStore,
{
    service.metrics().record_reconciliation();

    let principal = current.principal.as_ref();
    if let Some(principal) = principal {
        service.sign_in(principal).await;
    }
    let (record, resolution) = service.resolve_with_record(principal, None).await;
    let generation = principal
        .map(|p| service.status(p.uid()).generation)
        .unwrap_or_default();

    #[cfg(feature = "audit")]
    debug!(
        "Session resolved to '{}' ({:?}, generation {generation})",
        resolution.role, resolution.source
    );

    SessionSnapshot {
        principal: principal.cloned(),
        record,
        role: resolution.role,
        source: resolution.source,
        capabilities: derive_permissions(resolution.role),
        generation,
        sequence: current.sequence,
        resolved: true,
    }
}
