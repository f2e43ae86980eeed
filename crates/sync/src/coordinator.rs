//! Optimistic-concurrency synchronisation of the shared saved-links object.
//!
//! Every client owns a partial, possibly stale copy of the collection. A sync
//! call reads the shared object, merges the client's changes into it and
//! writes it back on the condition that nobody else wrote in between. Losing
//! that race is expected under load: the coordinator backs off and starts
//! over from a fresh read, up to a fixed number of conflicts.
//!
//! ```text
//! Read ──► Merge ──► Write ──► Done
//!  ▲                  │
//!  └──── Backoff ◄── Conflict ──► Exhausted
//! ```

use crate::error::{ErrorKind, Result};
use crate::record::{SavedLinkRecord, merge, parse_timestamp};
use async_trait::async_trait;
use exn::ResultExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use stash_config::Config;
use stash_storage::{ObjectVersion, StorageKey, StoreHandle, WriteCondition};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::instrument;

pub const SAVED_LINKS_KEY: &str = "cache/image-downloader/saved-links.json";
pub const DEFAULT_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Only return records updated strictly after this timestamp.
    #[serde(default)]
    pub since: Option<String>,
    /// Records created or changed by the client since its last sync.
    #[serde(default)]
    pub records: Vec<SavedLinkRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub records: Vec<SavedLinkRecord>,
    /// RFC 3339 timestamp of the server clock when the response was built.
    pub synced_at: String,
}

/// Delay between conflicting attempts: exponential from `base`, plus up to
/// `jitter` of random spread, never more than `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub jitter: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(50), jitter: Duration::from_millis(200), cap: Duration::from_millis(1000) }
    }
}

impl Backoff {
    /// Delay after the `conflict`-th conflict (1-based).
    pub fn delay(&self, conflict: u32) -> Duration {
        self.delay_with(conflict, rand::thread_rng().gen_range(0.0..1.0))
    }

    /// [`delay`](Self::delay) with the random fraction (`0.0..1.0`) supplied.
    pub fn delay_with(&self, conflict: u32, spread: f64) -> Duration {
        let exponential = self.base.saturating_mul(2_u32.saturating_pow(conflict));
        let jitter = self.jitter.mul_f64(spread.clamp(0.0, 1.0));
        exponential.saturating_add(jitter).min(self.cap)
    }
}

/// Waits out a backoff delay.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

enum Step {
    Read,
    Merge { stored: Vec<SavedLinkRecord>, version: Option<ObjectVersion> },
    Write { records: Vec<SavedLinkRecord>, condition: WriteCondition },
    Conflict(stash_storage::error::Error),
    Done(Vec<SavedLinkRecord>),
}

/// Synchronises client record sets with the single shared saved-links object.
#[derive(Clone)]
pub struct SyncCoordinator {
    store: StoreHandle,
    key: StorageKey,
    max_retries: u32,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl SyncCoordinator {
    pub fn new(store: StoreHandle) -> Result<Self> {
        let key = StorageKey::new(SAVED_LINKS_KEY).or_raise(|| ErrorKind::Storage)?;
        Ok(Self { store, key, max_retries: DEFAULT_MAX_RETRIES, backoff: Backoff::default(), sleeper: Arc::new(TokioSleeper) })
    }

    pub fn from_config(config: &Config, store: StoreHandle) -> Result<Self> {
        Ok(Self::new(store)?.with_max_retries(config.sync_max_retries))
    }

    /// Number of conflicting writes tolerated before giving up (at least one).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Merge `request.records` into the shared collection and return the
    /// records the client is missing.
    ///
    /// A request without records only reads, and a blank `since` is the same
    /// as none. Conflicting writes are retried from a fresh read; after
    /// `max_retries` of them the call fails with
    /// [`SyncContention`](ErrorKind::SyncContention). A stored object that is
    /// not a JSON array fails with [`Unreadable`](ErrorKind::Unreadable) and
    /// is never overwritten. Any other storage failure aborts immediately.
    #[instrument(skip_all, fields(key = %self.key, submitted = request.records.len(), since = ?request.since))]
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        let records = self.run(&request.records).await?;
        let records = match request.since.as_deref().map(str::trim).filter(|since| !since.is_empty()) {
            Some(since) => {
                // An unreadable `since` matches nothing, like comparing against NaN.
                let since = parse_timestamp(since);
                records.into_iter().filter(|record| since.is_some_and(|since| record.updated_after(since))).collect()
            },
            None => records,
        };
        let synced_at = OffsetDateTime::now_utc().format(&Rfc3339).or_raise(|| ErrorKind::Serialization)?;
        Ok(SyncResponse { records, synced_at })
    }

    async fn run(&self, submitted: &[SavedLinkRecord]) -> Result<Vec<SavedLinkRecord>> {
        let mut conflicts = 0;
        let mut step = Step::Read;
        loop {
            step = match step {
                Step::Read => self.read().await?,
                Step::Merge { stored, .. } if submitted.is_empty() => Step::Done(stored),
                Step::Merge { stored, version } => {
                    let records = merge(stored, submitted.to_vec());
                    let condition = version.map_or(WriteCondition::IfAbsent, WriteCondition::IfMatch);
                    Step::Write { records, condition }
                },
                Step::Write { records, condition } => self.write(records, condition).await?,
                Step::Conflict(err) => {
                    conflicts += 1;
                    if conflicts >= self.max_retries {
                        tracing::error!(conflicts, "Giving up on saved links sync");
                        return Err(err).or_raise(|| ErrorKind::SyncContention(conflicts));
                    }
                    let delay = self.backoff.delay(conflicts);
                    tracing::warn!(conflicts, delay = ?delay, "Saved links changed concurrently, retrying");
                    self.sleeper.sleep(delay).await;
                    Step::Read
                },
                Step::Done(records) => return Ok(records),
            };
        }
    }

    async fn read(&self) -> Result<Step> {
        let Some(object) = self.store.get(&self.key).await.or_raise(|| ErrorKind::Storage)? else {
            return Ok(Step::Merge { stored: Vec::new(), version: None });
        };
        let stored = if object.content.trim_ascii().is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice::<Vec<SavedLinkRecord>>(&object.content).or_raise(|| ErrorKind::Unreadable)?
        };
        Ok(Step::Merge { stored, version: object.version })
    }

    async fn write(&self, records: Vec<SavedLinkRecord>, condition: WriteCondition) -> Result<Step> {
        let body = serde_json::to_vec_pretty(&records).or_raise(|| ErrorKind::Serialization)?;
        match self.store.put(&self.key, body, Some("application/json"), condition).await {
            Ok(()) => {
                tracing::info!(count = records.len(), "Saved links synchronised");
                Ok(Step::Done(records))
            },
            Err(err) if err.is_conflict() => Ok(Step::Conflict(err)),
            Err(err) => Err(err).or_raise(|| ErrorKind::Storage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use stash_storage::backend::MockStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    impl RecordingSleeper {
        fn delays(&self) -> Vec<Duration> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.0.lock().unwrap().push(duration);
        }
    }

    fn coordinator(store: &Arc<MockStore>, sleeper: &Arc<RecordingSleeper>) -> SyncCoordinator {
        SyncCoordinator::new(store.clone() as StoreHandle).unwrap().with_sleeper(sleeper.clone())
    }

    fn body(records: &[SavedLinkRecord]) -> Vec<u8> {
        serde_json::to_vec_pretty(records).unwrap()
    }

    async fn stored(store: &MockStore) -> Vec<SavedLinkRecord> {
        serde_json::from_slice(&store.object(SAVED_LINKS_KEY).await.unwrap()).unwrap()
    }

    fn ids(records: &[SavedLinkRecord]) -> Vec<String> {
        records.iter().map(|record| record.id().unwrap_or_default()).collect()
    }

    #[rstest]
    #[case(1, 0.0, 100)]
    #[case(1, 0.5, 200)]
    #[case(2, 0.0, 200)]
    #[case(3, 0.999, 599)]
    #[case(4, 1.0, 1000)]
    #[case(5, 0.0, 1000)]
    #[case(40, 0.0, 1000)]
    fn test_backoff(#[case] conflict: u32, #[case] spread: f64, #[case] expected_ms: u64) {
        let delay = Backoff::default().delay_with(conflict, spread);
        assert_eq!(delay.as_millis(), u128::from(expected_ms));
    }

    #[test]
    fn test_backoff_bounds() {
        let backoff = Backoff::default();
        for conflict in 1..=10 {
            let delay = backoff.delay(conflict);
            let floor = Duration::from_millis(50 * 2_u64.pow(conflict)).min(backoff.cap);
            assert!(delay >= floor && delay <= backoff.cap, "{conflict}: {delay:?}");
        }
    }

    #[test]
    fn test_response_shape() {
        let response = SyncResponse { records: vec![SavedLinkRecord::new("a", "2025-03-01T10:00:00Z")], synced_at: "now".to_string() };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["syncedAt"], "now");
        assert_eq!(json["records"][0]["updated_at"], "2025-03-01T10:00:00Z");

        let request: SyncRequest = serde_json::from_str(r#"{"records": [{"id": "x", "updated_at": "2025-03-01"}]}"#).unwrap();
        assert_eq!(request.since, None);
        assert_eq!(request.records.len(), 1);
        assert_eq!(serde_json::from_str::<SyncRequest>("{}").unwrap(), SyncRequest::default());
    }

    #[tokio::test]
    async fn test_first_sync_creates_object() {
        let store = Arc::new(MockStore::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let records = vec![SavedLinkRecord::new("a", "2025-03-01T10:00:00Z").with_field("url", "https://x.example")];

        let response = coordinator(&store, &sleeper).sync(SyncRequest { since: None, records: records.clone() }).await.unwrap();

        assert_eq!(response.records, records);
        assert!(OffsetDateTime::parse(&response.synced_at, &Rfc3339).is_ok());
        assert_eq!(stored(&store).await, records);
        assert_eq!(store.content_type(SAVED_LINKS_KEY).await.as_deref(), Some("application/json"));
        assert!(String::from_utf8(store.object(SAVED_LINKS_KEY).await.unwrap()).unwrap().starts_with("[\n  {"));
        assert_eq!(store.calls().put, 1);
    }

    #[tokio::test]
    async fn test_merge_and_since_filter() {
        let existing = vec![
            SavedLinkRecord::new("a", "2025-03-01T10:00:00Z"),
            SavedLinkRecord::new("b", "2025-03-02T10:00:00Z"),
        ];
        let store = Arc::new(MockStore::with_objects([(SAVED_LINKS_KEY, body(&existing))]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let request = SyncRequest {
            since: Some("2025-03-01T12:00:00Z".to_string()),
            records: vec![
                SavedLinkRecord::new("a", "2025-03-03T10:00:00Z").with_field("title", "edited"),
                SavedLinkRecord::new("c", "2025-02-01T10:00:00Z"),
            ],
        };

        let response = coordinator(&store, &sleeper).sync(request).await.unwrap();

        assert_eq!(ids(&response.records), ["a", "b"]);
        assert_eq!(response.records[0].field("title"), Some(&serde_json::json!("edited")));
        assert_eq!(ids(&stored(&store).await), ["a", "b", "c"]);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_sync_never_writes() {
        let existing = vec![SavedLinkRecord::new("a", "2025-03-01T10:00:00Z")];
        let store = Arc::new(MockStore::with_objects([(SAVED_LINKS_KEY, body(&existing))]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let all = coordinator(&store, &sleeper).sync(SyncRequest::default()).await.unwrap();
        let unreadable_since = coordinator(&store, &sleeper)
            .sync(SyncRequest { since: Some("last tuesday".to_string()), records: Vec::new() })
            .await
            .unwrap();

        assert_eq!(all.records, existing);
        assert!(unreadable_since.records.is_empty());
        assert_eq!(store.calls().put, 0);

        let empty = Arc::new(MockStore::default());
        let response = coordinator(&empty, &sleeper).sync(SyncRequest::default()).await.unwrap();
        assert!(response.records.is_empty());
        assert_eq!(empty.object(SAVED_LINKS_KEY).await, None);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_from_a_fresh_read() {
        let store = Arc::new(MockStore::with_objects([(SAVED_LINKS_KEY, body(&[SavedLinkRecord::new("a", "2025-03-01T10:00:00Z")]))]));
        // Two other writers get in first, each adding their own record.
        store.reject_conditional_writes(
            2,
            Some(|n: usize| {
                let mut records = vec![SavedLinkRecord::new("a", "2025-03-01T10:00:00Z")];
                records.extend((1..=n).map(|i| SavedLinkRecord::new(format!("other-{i}"), "2025-03-01T11:00:00Z")));
                serde_json::to_vec(&records).unwrap()
            }),
        );
        let sleeper = Arc::new(RecordingSleeper::default());
        let request = SyncRequest { since: None, records: vec![SavedLinkRecord::new("mine", "2025-03-01T12:00:00Z")] };

        let response = coordinator(&store, &sleeper).sync(request).await.unwrap();

        assert_eq!(store.calls().get, 3);
        assert_eq!(store.calls().put, 3);
        assert_eq!(ids(&response.records), ["a", "other-1", "other-2", "mine"]);
        assert_eq!(stored(&store).await, response.records);
        let delays = sleeper.delays();
        assert_eq!(delays.len(), 2);
        assert!(delays[0] >= Duration::from_millis(100) && delays[0] < Duration::from_millis(300));
        assert!(delays[1] >= Duration::from_millis(200) && delays[1] < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_contention_is_exhausted() {
        let store = Arc::new(MockStore::default());
        store.reject_conditional_writes(usize::MAX, None::<fn(usize) -> Vec<u8>>);
        let sleeper = Arc::new(RecordingSleeper::default());
        let request = SyncRequest { since: None, records: vec![SavedLinkRecord::new("mine", "2025-03-01T12:00:00Z")] };

        let err = coordinator(&store, &sleeper).with_max_retries(4).sync(request).await.unwrap_err();

        assert!(matches!(&*err, ErrorKind::SyncContention(4)));
        assert!(err.is_retryable());
        assert_eq!(store.calls().put, 4);
        assert_eq!(sleeper.delays().len(), 3);
    }

    #[tokio::test]
    async fn test_storage_failure_aborts() {
        let store = Arc::new(MockStore::default());
        store.set_unavailable(true);
        let sleeper = Arc::new(RecordingSleeper::default());
        let request = SyncRequest { since: None, records: vec![SavedLinkRecord::new("mine", "2025-03-01T12:00:00Z")] };

        let err = coordinator(&store, &sleeper).sync(request).await.unwrap_err();

        assert!(matches!(&*err, ErrorKind::Storage));
        assert_eq!(store.calls().get, 1);
        assert_eq!(store.calls().put, 0);
        assert!(sleeper.delays().is_empty());
    }

    #[rstest]
    #[case(b"{not json".as_slice())]
    #[case(br#"{"id": "a"}"#.as_slice())]
    #[case(b"null".as_slice())]
    #[tokio::test]
    async fn test_unreadable_object_is_never_overwritten(#[case] content: &[u8]) {
        let store = Arc::new(MockStore::with_objects([(SAVED_LINKS_KEY, content.to_vec())]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let records = vec![SavedLinkRecord::new("mine", "2025-03-01T12:00:00Z")];

        let err = coordinator(&store, &sleeper).sync(SyncRequest { since: None, records }).await.unwrap_err();

        assert!(matches!(&*err, ErrorKind::Unreadable));
        assert!(!err.is_retryable());
        assert_eq!(store.calls().put, 0);
        assert_eq!(store.object(SAVED_LINKS_KEY).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_blank_object_starts_empty() {
        let store = Arc::new(MockStore::with_objects([(SAVED_LINKS_KEY, b"  \n".to_vec())]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let records = vec![SavedLinkRecord::new("mine", "2025-03-01T12:00:00Z")];

        let response = coordinator(&store, &sleeper).sync(SyncRequest { since: None, records: records.clone() }).await.unwrap();

        assert_eq!(response.records, records);
        assert_eq!(stored(&store).await, records);
    }

    #[tokio::test]
    async fn test_loosely_typed_records_survive_a_sync() {
        let existing = serde_json::json!([
            {"id": 1, "updated_at": "2025-03-01T10:00:00Z", "url": "https://keep.me/1"},
            {"id": "b", "updated_at": "2025-03-01T10:00:00Z", "url": "https://keep.me/b"},
            {"id": null, "url": "https://keep.me/orphan"},
        ]);
        let store = Arc::new(MockStore::with_objects([(SAVED_LINKS_KEY, serde_json::to_vec(&existing).unwrap())]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let request = SyncRequest { since: None, records: vec![SavedLinkRecord::new("c", "2025-03-01T12:00:00Z")] };

        let response = coordinator(&store, &sleeper).sync(request).await.unwrap();

        assert_eq!(ids(&response.records), ["1", "b", "", "c"]);
        let written: serde_json::Value = serde_json::from_slice(&store.object(SAVED_LINKS_KEY).await.unwrap()).unwrap();
        assert_eq!(written[0], existing[0]);
        assert_eq!(written[1], existing[1]);
        assert_eq!(written[2], existing[2]);
        assert_eq!(written[3]["id"], "c");
    }

    #[rstest]
    #[case(Some(""))]
    #[case(Some("   "))]
    #[case(None)]
    #[tokio::test]
    async fn test_blank_since_returns_everything(#[case] since: Option<&str>) {
        let existing = vec![SavedLinkRecord::new("a", "2025-03-01T10:00:00Z")];
        let store = Arc::new(MockStore::with_objects([(SAVED_LINKS_KEY, body(&existing))]));
        let sleeper = Arc::new(RecordingSleeper::default());

        let response = coordinator(&store, &sleeper)
            .sync(SyncRequest { since: since.map(str::to_string), records: Vec::new() })
            .await
            .unwrap();

        assert_eq!(response.records, existing);
    }

    #[test]
    fn test_from_config() {
        let config = Config { sync_max_retries: 3, ..Config::default() };
        let coordinator = SyncCoordinator::from_config(&config, Arc::new(MockStore::default())).unwrap();
        assert_eq!(coordinator.max_retries, 3);
        assert_eq!(coordinator.key.as_str(), SAVED_LINKS_KEY);
    }
}
