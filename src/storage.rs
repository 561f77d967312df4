//! Storage abstractions for user records and the documents written at provisioning.

use crate::{
    error::{Error, Result},
    record::{CreatorApplication, ProfileDocument, RecordChange, RecordPatch, UserRecord},
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Trait for the document store that owns user records.
///
/// Every method is an awaited network round trip in production. `merge` has
/// partial-update semantics: fields the patch does not touch are preserved,
/// and all fields it does touch land together.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get a user record by uid.
    async fn get(&self, uid: &str) -> Result<Option<UserRecord>>;

    /// Merge a partial update into a user record, creating it if absent.
    async fn merge(&self, uid: &str, patch: RecordPatch) -> Result<UserRecord>;

    /// Create or replace a profile document.
    async fn upsert_profile(&self, profile: ProfileDocument) -> Result<()>;

    /// Store a creator application.
    async fn insert_application(&self, application: CreatorApplication) -> Result<()>;

    /// Subscribe to change notifications for successful writes.
    fn subscribe(&self) -> broadcast::Receiver<RecordChange>;
}

/// Counts of successful writes per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub user_merges: u64,
    pub profile_upserts: u64,
    pub application_inserts: u64,
    pub failed_writes: u64,
}

impl WriteCounts {
    /// Successful writes across all collections.
    pub fn total(&self) -> u64 {
        self.user_merges + self.profile_upserts + self.application_inserts
    }
}

/// A collection written by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Profiles,
    Applications,
}

#[derive(Debug, Default)]
struct WriteStats {
    user_merges: AtomicU64,
    profile_upserts: AtomicU64,
    application_inserts: AtomicU64,
    failed_writes: AtomicU64,
}

#[derive(Debug)]
struct MemoryInner {
    users: DashMap<String, UserRecord>,
    profiles: DashMap<String, ProfileDocument>,
    applications: DashMap<String, CreatorApplication>,
    stats: WriteStats,
    fail_users: AtomicBool,
    fail_profiles: AtomicBool,
    fail_applications: AtomicBool,
    fail_reads: AtomicBool,
    write_delay_ms: AtomicU64,
    changes: broadcast::Sender<RecordChange>,
}

/// In-memory store using DashMap for thread safety.
///
/// Clones share the same data. Write failures and latency can be injected to
/// exercise the degraded paths of the impersonation manager.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                users: DashMap::new(),
                profiles: DashMap::new(),
                applications: DashMap::new(),
                stats: WriteStats::default(),
                fail_users: AtomicBool::new(false),
                fail_profiles: AtomicBool::new(false),
                fail_applications: AtomicBool::new(false),
                fail_reads: AtomicBool::new(false),
                write_delay_ms: AtomicU64::new(0),
                changes,
            }),
        }
    }

    /// Insert a record directly, bypassing write accounting and notifications.
    pub fn seed(&self, record: UserRecord) {
        self.inner.users.insert(record.uid.clone(), record);
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        for collection in [Collection::Users, Collection::Profiles, Collection::Applications] {
            self.fail_collection(collection, fail);
        }
    }

    /// Make subsequent writes to one collection fail (or succeed again).
    pub fn fail_collection(&self, collection: Collection, fail: bool) {
        self.failing(collection).store(fail, Ordering::SeqCst);
    }

    fn failing(&self, collection: Collection) -> &AtomicBool {
        match collection {
            Collection::Users => &self.inner.fail_users,
            Collection::Profiles => &self.inner.fail_profiles,
            Collection::Applications => &self.inner.fail_applications,
        }
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Get write counters.
    pub fn write_counts(&self) -> WriteCounts {
        let stats = &self.inner.stats;
        WriteCounts {
            user_merges: stats.user_merges.load(Ordering::SeqCst),
            profile_upserts: stats.profile_upserts.load(Ordering::SeqCst),
            application_inserts: stats.application_inserts.load(Ordering::SeqCst),
            failed_writes: stats.failed_writes.load(Ordering::SeqCst),
        }
    }

    /// Get the number of stored user records.
    pub fn record_count(&self) -> usize {
        self.inner.users.len()
    }

    /// Get a stored profile.
    pub fn profile(&self, uid: &str) -> Option<ProfileDocument> {
        self.inner.profiles.get(uid).map(|p| p.clone())
    }

    /// Get all applications filed by `uid`.
    pub fn applications_for(&self, uid: &str) -> Vec<CreatorApplication> {
        self.inner
            .applications
            .iter()
            .filter(|entry| entry.value().uid == uid)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        self.inner.users.clear();
        self.inner.profiles.clear();
        self.inner.applications.clear();
    }

    async fn before_write(&self, collection: Collection, uid: &str) -> Result<()> {
        let delay = self.inner.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing(collection).load(Ordering::SeqCst) {
            self.inner.stats.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(Error::WriteFailed {
                uid: uid.to_string(),
                reason: "store unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn notify(&self, change: RecordChange) {
        // No subscribers is fine.
        let _ = self.inner.changes.send(change);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, uid: &str) -> Result<Option<UserRecord>> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("could not read '{uid}'")));
        }
        Ok(self.inner.users.get(uid).map(|r| r.clone()))
    }

    async fn merge(&self, uid: &str, patch: RecordPatch) -> Result<UserRecord> {
        self.before_write(Collection::Users, uid).await?;

        let now = Utc::now();
        let record = match self.inner.users.entry(uid.to_string()) {
            Entry::Occupied(mut entry) => {
                let merged = patch.apply(uid, Some(entry.get().clone()), now);
                entry.insert(merged.clone());
                merged
            }
            Entry::Vacant(entry) => {
                let created = patch.apply(uid, None, now);
                entry.insert(created.clone());
                created
            }
        };

        self.inner.stats.user_merges.fetch_add(1, Ordering::SeqCst);
        self.notify(RecordChange::User {
            uid: uid.to_string(),
            role: record.role,
        });
        Ok(record)
    }

    async fn upsert_profile(&self, profile: ProfileDocument) -> Result<()> {
        self.before_write(Collection::Profiles, &profile.uid).await?;

        let uid = profile.uid.clone();
        self.inner.profiles.insert(uid.clone(), profile);
        self.inner.stats.profile_upserts.fetch_add(1, Ordering::SeqCst);
        self.notify(RecordChange::Profile { uid });
        Ok(())
    }

    async fn insert_application(&self, application: CreatorApplication) -> Result<()> {
        self.before_write(Collection::Applications, &application.uid).await?;

        let change = RecordChange::Application {
            uid: application.uid.clone(),
            id: application.id.clone(),
        };
        self.inner
            .applications
            .insert(application.id.clone(), application);
        self.inner
            .stats
            .application_inserts
            .fetch_add(1, Ordering::SeqCst);
        self.notify(change);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.inner.changes.subscribe()
    }
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn get(&self, uid: &str) -> Result<Option<UserRecord>> {
        (**self).get(uid).await
    }

    async fn merge(&self, uid: &str, patch: RecordPatch) -> Result<UserRecord> {
        (**self).merge(uid, patch).await
    }

    async fn upsert_profile(&self, profile: ProfileDocument) -> Result<()> {
        (**self).upsert_profile(profile).await
    }

    async fn insert_application(&self, application: CreatorApplication) -> Result<()> {
        (**self).insert_application(application).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        (**self).subscribe()
    }
}

/// File-based store (requires persistence feature).
#[cfg(feature = "persistence")]
pub mod file_storage {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::BTreeMap,
        fs::{self, File},
        io::{BufReader, BufWriter},
        path::{Path, PathBuf},
    };
    use tokio::sync::Mutex;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct FileState {
        users: BTreeMap<String, UserRecord>,
        profiles: BTreeMap<String, ProfileDocument>,
        applications: BTreeMap<String, CreatorApplication>,
    }

    /// Store that persists every collection to one JSON file.
    #[derive(Debug)]
    pub struct FileRecordStore {
        storage_path: PathBuf,
        state: Mutex<FileState>,
        changes: broadcast::Sender<RecordChange>,
    }

    impl FileRecordStore {
        /// Open (or create) a store backed by `storage_path`.
        pub fn open(storage_path: impl AsRef<Path>) -> Result<Self> {
            let storage_path = storage_path.as_ref().to_path_buf();

            if let Some(parent) = storage_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let state = if storage_path.exists() {
                let reader = BufReader::new(File::open(&storage_path)?);
                serde_json::from_reader(reader)?
            } else {
                FileState::default()
            };

            let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
            Ok(Self {
                storage_path,
                state: Mutex::new(state),
                changes,
            })
        }

        /// Get the storage file path.
        pub fn storage_path(&self) -> &Path {
            &self.storage_path
        }

        /// Get the number of stored user records.
        pub async fn record_count(&self) -> usize {
            self.state.lock().await.users.len()
        }

        fn save(&self, state: &FileState) -> Result<()> {
            let tmp = self.storage_path.with_extension("tmp");
            {
                let writer = BufWriter::new(File::create(&tmp)?);
                serde_json::to_writer_pretty(writer, state)?;
            }
            fs::rename(&tmp, &self.storage_path)?;
            Ok(())
        }
    }

    fn restore<T>(collection: &mut BTreeMap<String, T>, key: &str, previous: Option<T>) {
        match previous {
            Some(previous) => collection.insert(key.to_string(), previous),
            None => collection.remove(key),
        };
    }

    fn write_failed(uid: &str, e: Error) -> Error {
        Error::WriteFailed {
            uid: uid.to_string(),
            reason: e.to_string(),
        }
    }

    #[async_trait]
    impl RecordStore for FileRecordStore {
        async fn get(&self, uid: &str) -> Result<Option<UserRecord>> {
            Ok(self.state.lock().await.users.get(uid).cloned())
        }

        async fn merge(&self, uid: &str, patch: RecordPatch) -> Result<UserRecord> {
            let mut state = self.state.lock().await;
            let existing = state.users.get(uid).cloned();
            let record = patch.apply(uid, existing, Utc::now());
            let previous = state.users.insert(uid.to_string(), record.clone());

            if let Err(e) = self.save(&state) {
                // Keep memory and disk in agreement.
                restore(&mut state.users, uid, previous);
                return Err(write_failed(uid, e));
            }

            let _ = self.changes.send(RecordChange::User {
                uid: uid.to_string(),
                role: record.role,
            });
            Ok(record)
        }

        async fn upsert_profile(&self, profile: ProfileDocument) -> Result<()> {
            let mut state = self.state.lock().await;
            let uid = profile.uid.clone();
            let previous = state.profiles.insert(uid.clone(), profile);
            if let Err(e) = self.save(&state) {
                restore(&mut state.profiles, &uid, previous);
                return Err(write_failed(&uid, e));
            }
            let _ = self.changes.send(RecordChange::Profile { uid });
            Ok(())
        }

        async fn insert_application(&self, application: CreatorApplication) -> Result<()> {
            let mut state = self.state.lock().await;
            let uid = application.uid.clone();
            let id = application.id.clone();
            let previous = state.applications.insert(id.clone(), application);
            if let Err(e) = self.save(&state) {
                restore(&mut state.applications, &id, previous);
                return Err(write_failed(&uid, e));
            }
            let _ = self.changes.send(RecordChange::Application { uid, id });
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
            self.changes.subscribe()
        }
    }

}

#[cfg(feature = "persistence")]
pub use file_storage::FileRecordStore;
