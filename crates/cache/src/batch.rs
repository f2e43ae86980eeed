use crate::ResourceCache;
use crate::fetch::Headers;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{HashMap, HashSet, VecDeque};

/// Mirror many resources at once and map every source URL to the URL it
/// should be served from.
///
/// [`ResourceCache::cache_many`] is the same with the cache's configured
/// concurrency. Duplicate URLs are cached once. At most `concurrency` (at least one)
/// downloads are in flight; the rest wait in a queue and are promoted as
/// in-flight operations complete. A failed item is logged and maps to
/// itself, so the result always covers every distinct input URL.
pub async fn cache_many<I, S>(
    cache: &ResourceCache,
    urls: I,
    namespace: &str,
    headers: &Headers,
    concurrency: usize,
    scope: Option<&str>,
) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut pending: VecDeque<String> = urls
        .into_iter()
        .map(|url| url.as_ref().to_string())
        .filter(|url| seen.insert(url.clone()))
        .collect();
    let mut resolved = HashMap::with_capacity(pending.len());

    let cache_one = |url: String| async move {
        let result = cache.cache_from_url(&url, namespace, headers, scope).await;
        (url, result)
    };
    let mut processing = FuturesUnordered::new();
    processing.extend(pending.drain(..concurrency.max(1).min(pending.len())).map(&cache_one));
    while let Some((url, result)) = processing.next().await {
        let target = match result {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(url = %url, namespace, error = ?err, "Caching failed, serving source URL");
                url.clone()
            },
        };
        resolved.insert(url, target);
        if let Some(next) = pending.pop_front() {
            processing.push(cache_one(next));
        }
    }
    resolved
}
