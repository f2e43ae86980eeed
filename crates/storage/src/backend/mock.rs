//! In-memory object store for testing.

use crate::error::{ErrorKind, Result};
use crate::{ObjectStore, ObjectVersion, PublicLocation, StorageKey, StoredObject, WriteCondition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;

type CompetingWrite = Box<dyn Fn(usize) -> Vec<u8> + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    content_type: String,
    version: ObjectVersion,
}

/// Number of calls made against a [`MockStore`], per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub exists: usize,
    pub get: usize,
    pub put: usize,
}

/// In-memory object store for testing.
///
/// Objects live in a `HashMap` behind a [`RwLock`], and conditional writes
/// are honoured exactly like S3 does (`If-Match` against a monotonically
/// increasing ETag, `If-None-Match: *` against existence). On top of that,
/// tests can:
///
/// - count calls per operation ([`calls`](Self::calls)),
/// - reject the next N conditional writes, optionally letting a competing
///   writer "win" each race ([`reject_conditional_writes`](Self::reject_conditional_writes)),
/// - deny existence checks so `exists` falls back to a read, as S3 does on a
///   403 ([`deny_exists`](Self::deny_exists)),
/// - make every operation fail ([`set_unavailable`](Self::set_unavailable)).
///
/// # Examples
///
/// ```
/// use stash_storage::backend::MockStore;
/// use stash_storage::{ObjectStore, StorageKey, WriteCondition};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MockStore::with_objects([("cache/n/a.jpg", b"jpeg...")]);
/// let key = StorageKey::new("cache/n/a.jpg")?;
/// assert!(store.exists(&key).await);
///
/// let err = store.put(&key, b"new".to_vec(), None, WriteCondition::IfAbsent).await.unwrap_err();
/// assert!(err.is_conflict());
/// assert_eq!(store.calls().put, 1);
/// # Ok(())
/// # }
/// ```
pub struct MockStore {
    name: String,
    location: PublicLocation,
    storage: RwLock<HashMap<StorageKey, Entry>>,
    next_version: AtomicU64,
    exists_calls: AtomicUsize,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    unavailable: AtomicBool,
    exists_denied: AtomicBool,
    rejections: AtomicUsize,
    rejected: AtomicUsize,
    competing_write: Mutex<Option<CompetingWrite>>,
}

impl MockStore {
    /// Create a mock store pre-populated with objects.
    ///
    /// Panics if any key fails validation. If test setup is wrong, then test
    /// should not pass.
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let mut store = Self {
            name: "mock".to_string(),
            location: PublicLocation::new(None, "https://storage.mock", "bucket"),
            storage: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            exists_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            exists_denied: AtomicBool::new(false),
            rejections: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            competing_write: Mutex::new(None),
        };
        let mut entries = Vec::new();
        for (key, data) in objects {
            let key = key.into();
            let Ok(validated) = StorageKey::new(key.clone()) else {
                // The panic here is DELIBERATE. MockStore is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockStore::with_objects: invalid key {key}");
            };
            entries.push((validated, store.entry(data.into(), crate::DEFAULT_CONTENT_TYPE)));
        }
        store.storage.get_mut().extend(entries);
        store
    }

    /// Change the name of the mock store.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Serve public URLs from `base` instead of the mock endpoint.
    pub fn with_public_base(mut self, base: &str) -> Self {
        self.location = PublicLocation::new(Some(base), "https://storage.mock", "bucket");
        self
    }

    /// Reject the next `count` conditional writes with a conflict.
    ///
    /// When `competing` is given, each rejection first stores the bytes it
    /// returns (with a fresh version), as if another writer had won the race.
    /// The closure receives the 1-based number of the rejection.
    pub fn reject_conditional_writes(
        &self,
        count: usize,
        competing: Option<impl Fn(usize) -> Vec<u8> + Send + Sync + 'static>,
    ) {
        self.rejections.store(count, Ordering::SeqCst);
        self.rejected.store(0, Ordering::SeqCst);
        let competing = competing.map(|f| Box::new(f) as CompetingWrite);
        *self.competing_write.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = competing;
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Deny (or allow again) the lightweight existence check. While denied,
    /// `exists` answers from a full read, counted as a `get` call.
    pub fn deny_exists(&self, denied: bool) {
        self.exists_denied.store(denied, Ordering::SeqCst);
    }

    /// Snapshot of how many times each operation has been called.
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            exists: self.exists_calls.load(Ordering::SeqCst),
            get: self.get_calls.load(Ordering::SeqCst),
            put: self.put_calls.load(Ordering::SeqCst),
        }
    }

    /// Raw bytes currently stored under `key`, bypassing call counters.
    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        let key = StorageKey::new(key).ok()?;
        self.storage.read().await.get(&key).map(|entry| entry.data.clone())
    }

    /// Content type recorded for `key`, bypassing call counters.
    pub async fn content_type(&self, key: &str) -> Option<String> {
        let key = StorageKey::new(key).ok()?;
        self.storage.read().await.get(&key).map(|entry| entry.content_type.clone())
    }

    fn entry(&self, data: Vec<u8>, content_type: &str) -> Entry {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        Entry {
            data,
            content_type: content_type.to_string(),
            version: ObjectVersion::new(format!("\"{version}\"")),
        }
    }

    fn check_available(&self, key: &StorageKey) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Network(format!("mock store unavailable ({key})")));
        }
        Ok(())
    }

    /// Consume one scripted rejection, if any remain.
    fn take_rejection(&self) -> Option<usize> {
        self.rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .ok()
            .map(|_| self.rejected.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl Default for MockStore {
    fn default() -> Self {
        let objects: [(&str, &[u8]); 0] = [];
        Self::with_objects(objects)
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &StorageKey) -> bool {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        if self.check_available(key).is_err() {
            return false;
        }
        if self.exists_denied.load(Ordering::SeqCst) {
            tracing::debug!(store = %self.name, key = %key, "Existence check denied, falling back to read");
            return matches!(self.get(key).await, Ok(Some(_)));
        }
        self.storage.read().await.contains_key(key)
    }

    async fn get(&self, key: &StorageKey) -> Result<Option<StoredObject>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available(key)?;
        Ok(self
            .storage
            .read()
            .await
            .get(key)
            .map(|entry| StoredObject::new(entry.data.clone(), Some(entry.version.clone()))))
    }

    async fn put(
        &self,
        key: &StorageKey,
        data: Vec<u8>,
        content_type: Option<&str>,
        condition: WriteCondition,
    ) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available(key)?;

        if condition.is_conditional()
            && let Some(attempt) = self.take_rejection()
        {
            let competing = {
                let guard = self.competing_write.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.as_ref().map(|write| write(attempt))
            };
            if let Some(bytes) = competing {
                let entry = self.entry(bytes, "application/json");
                self.storage.write().await.insert(key.clone(), entry);
            }
            exn::bail!(ErrorKind::Conflict(key.to_string()));
        }

        let mut guard = self.storage.write().await;
        let satisfied = match &condition {
            WriteCondition::None => true,
            WriteCondition::IfMatch(version) => guard.get(key).is_some_and(|entry| &entry.version == version),
            WriteCondition::IfAbsent => !guard.contains_key(key),
        };
        if !satisfied {
            exn::bail!(ErrorKind::Conflict(key.to_string()));
        }
        let entry = self.entry(data, content_type.unwrap_or(crate::DEFAULT_CONTENT_TYPE));
        guard.insert(key.clone(), entry);
        Ok(())
    }

    fn public_url(&self, key: &StorageKey) -> String {
        self.location.url(key)
    }
}
