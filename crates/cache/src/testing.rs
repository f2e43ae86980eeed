use crate::error::{ErrorKind, Result};
use crate::fetch::{Fetch, Fetched, Headers};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Fetcher that never touches the network.
///
/// Returns the URL itself as the body, fails for URLs registered with
/// [`failing`](Self::failing), and records the peak number of concurrent
/// fetches.
#[derive(Default)]
pub(crate) struct StubFetcher {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Option<Duration>,
    failing: HashSet<String>,
    seen_headers: Mutex<Vec<Headers>>,
}

impl StubFetcher {
    pub(crate) fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn last_headers(&self) -> Option<Headers> {
        self.seen_headers.lock().ok()?.last().cloned()
    }
}

#[async_trait]
impl Fetch for StubFetcher {
    async fn fetch(&self, url: &str, headers: &Headers) -> Result<Fetched> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen_headers.lock() {
            seen.push(headers.clone());
        }
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing.contains(url) {
            exn::bail!(ErrorKind::Fetch(format!("{url} (status 404 Not Found)")));
        }
        Ok(Fetched { bytes: url.as_bytes().to_vec(), content_type: "image/jpeg".to_string() })
    }
}
