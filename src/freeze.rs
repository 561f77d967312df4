//! Process-local flicker suppression.
//!
//! While an impersonation write commits and propagates to subscribed readers,
//! they may briefly observe a half-updated world (old role, new override, or
//! the reverse). A freeze pins the resolved role for a uid to the last-known
//! value for a short window. It never influences authorization beyond that
//! window and is never persisted.

use crate::role::Role;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct FreezeEntry {
    last_known: Role,
    frozen_until: Instant,
}

/// Per-uid freeze windows and the last-known role each one pins.
///
/// Only uids with an open window are tracked. Expired windows are dropped
/// when read and whenever a new window opens.
#[derive(Debug, Default)]
pub struct FreezeRegistry {
    entries: DashMap<String, FreezeEntry>,
}

impl FreezeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `uid` to `role` for `window` starting at `now`.
    pub fn freeze(&self, uid: &str, role: Role, window: Duration, now: Instant) {
        self.entries.retain(|_, entry| now < entry.frozen_until);
        self.entries.insert(
            uid.to_string(),
            FreezeEntry {
                last_known: role,
                frozen_until: now + window,
            },
        );
    }

    /// Get the pinned role if a freeze window is open at `now`.
    pub fn frozen_role(&self, uid: &str, now: Instant) -> Option<Role> {
        let entry = *self.entries.get(uid)?;
        if now < entry.frozen_until {
            return Some(entry.last_known);
        }
        self.entries
            .remove_if(uid, |_, entry| now >= entry.frozen_until);
        None
    }

    /// Check if a freeze window is open for `uid`.
    pub fn is_frozen(&self, uid: &str, now: Instant) -> bool {
        self.frozen_role(uid, now).is_some()
    }

    /// Close any open freeze window for `uid` (sign-out).
    pub fn thaw(&self, uid: &str) {
        self.entries.remove(uid);
    }

    /// Get the number of uids with a window that has not been pruned yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no window is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
