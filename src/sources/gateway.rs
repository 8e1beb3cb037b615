use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::sources::http::backoff_delay;
use crate::sources::{
    FetchQuery, FetchStatus, RawItem, RateLimiter, ResponseCache, SourceClient, SourceError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Fetched from the provider just now
    Fresh,
    /// Exact cache hit within TTL
    Cached,
    /// Best-effort substitute after a denial or failure
    StaleFallback,
    /// Nothing to serve
    Empty,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provenance::Fresh => "fresh",
            Provenance::Cached => "cached",
            Provenance::StaleFallback => "stale_fallback",
            Provenance::Empty => "empty",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub items: Vec<RawItem>,
    pub provenance: Provenance,
    /// Provider status, when a request was actually made
    pub status: Option<FetchStatus>,
    pub error: Option<SourceError>,
}

/// The path every ingestion fetch takes: cache, quota, provider, fallback.
///
/// Transient provider failures are retried up to `max_retries` times with
/// backoff. Each attempt takes its own limiter permit, so retries count
/// against the daily quota and respect the minimum spacing.
pub struct SourceGateway {
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    max_retries: u8,
}

impl SourceGateway {
    pub fn new(
        cache: Arc<ResponseCache>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        max_retries: u8,
    ) -> Self {
        Self {
            cache,
            limiter,
            clock,
            max_retries,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn fetch(&self, client: &dyn SourceClient, query: &FetchQuery) -> FetchOutcome {
        let source = client.name();
        let key = query.cache_key(source);

        if let Some(items) = self.cache.get_fresh(&key) {
            log::debug!("source={source} outcome=cached items={} query={:?}", items.len(), query.query);
            return FetchOutcome {
                items,
                provenance: Provenance::Cached,
                status: None,
                error: None,
            };
        }

        let mut attempt = 0u8;
        let mut last_status = None;
        loop {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                log::debug!(
                    "source={source} retrying (attempt {attempt}/{}) in {delay:?}",
                    self.max_retries
                );
                self.clock.sleep(delay);
            }

            if !self.limiter.acquire(source) {
                log::warn!("source={source} outcome=quota_exceeded attempt={attempt} query={:?}", query.query);
                let error = SourceError::QuotaExceeded {
                    source_name: source.to_string(),
                };
                return self.fallback(source, query, last_status, error);
            }
            attempt += 1;

            let response = client.fetch(query);
            if response.status.success {
                log::info!(
                    "source={source} outcome=fresh items={} attempts={attempt} query={:?}",
                    response.items.len(),
                    query.query
                );
                self.cache.put(source, &key, response.items.clone());
                return FetchOutcome {
                    items: response.items,
                    provenance: Provenance::Fresh,
                    status: Some(response.status),
                    error: None,
                };
            }

            let status = response.status;
            log::warn!(
                "source={source} outcome=failed http_status={:?} rate_limited={} transient={} message={:?}",
                status.http_status,
                status.is_rate_limited(),
                status.transient,
                status.message
            );
            if status.transient && attempt <= self.max_retries {
                last_status = Some(status);
                continue;
            }

            let error = SourceError::SourceUnavailable {
                source_name: source.to_string(),
                message: status.message.clone(),
            };
            return self.fallback(source, query, Some(status), error);
        }
    }

    fn fallback(
        &self,
        source: &str,
        query: &FetchQuery,
        status: Option<FetchStatus>,
        error: SourceError,
    ) -> FetchOutcome {
        match self.cache.stale_fallback(&query.similar_prefix(source), source) {
            Some(hit) => {
                log::info!(
                    "source={source} outcome=stale_fallback items={} cached_key={:?} stored_at={}",
                    hit.items.len(),
                    hit.key,
                    hit.stored_at
                );
                FetchOutcome {
                    items: hit.items,
                    provenance: Provenance::StaleFallback,
                    status,
                    error: Some(error),
                }
            }
            None => {
                log::info!("source={source} outcome=empty");
                FetchOutcome {
                    items: vec![],
                    provenance: Provenance::Empty,
                    status,
                    error: Some(error),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::content::SourceType;
    use crate::sources::fake::FakeSource;
    use crate::sources::{FetchResponse, SourceBudget};

    struct Fixture {
        clock: Arc<ManualClock>,
        gateway: SourceGateway,
        source: FakeSource,
    }

    fn fixture(quota: u32) -> Fixture {
        let clock = Arc::new(ManualClock::at("2024-05-01T10:00:00Z"));
        let cache = Arc::new(ResponseCache::new(clock.clone(), Duration::from_secs(3600), 100));
        let limiter = Arc::new(RateLimiter::new(clock.clone()));
        limiter.register(
            "fake",
            SourceBudget {
                daily_quota: quota,
                min_interval: Duration::from_secs(1),
            },
        );
        let gateway = SourceGateway::new(cache, limiter, clock.clone(), 3);
        Fixture {
            clock,
            gateway,
            source: FakeSource::new("fake", SourceType::News),
        }
    }

    #[test]
    fn test_second_identical_fetch_is_cached() {
        let f = fixture(10);
        f.source.push_articles(&["https://a.test/1"]);
        let q = FetchQuery::new("rust", 20);

        let first = f.gateway.fetch(&f.source, &q);
        assert_eq!(first.provenance, Provenance::Fresh);
        let second = f.gateway.fetch(&f.source, &q);
        assert_eq!(second.provenance, Provenance::Cached);
        assert_eq!(second.items, first.items);
        assert_eq!(f.source.calls(), 1);
    }

    #[test]
    fn test_quota_exhausted_serves_expired_similar_entry() {
        let f = fixture(1);
        f.source.push_articles(&["https://a.test/1"]);
        f.gateway.fetch(&f.source, &FetchQuery::new("rust", 20));

        f.clock.advance(chrono::Duration::hours(5));
        let mut page2 = FetchQuery::new("rust", 20);
        page2.page = 2;
        let out = f.gateway.fetch(&f.source, &page2);

        assert_eq!(out.provenance, Provenance::StaleFallback);
        assert_eq!(out.items.len(), 1);
        assert!(matches!(out.error, Some(SourceError::QuotaExceeded { .. })));
        assert_eq!(f.source.calls(), 1);
    }

    #[test]
    fn test_rate_limited_response_falls_back() {
        let f = fixture(10);
        f.source.push_articles(&["https://a.test/1"]);
        f.gateway.fetch(&f.source, &FetchQuery::new("rust", 20));

        f.source.push(FetchResponse::failed(Some(429), "too many requests"));
        let out = f.gateway.fetch(&f.source, &FetchQuery::new("golang", 20));

        assert_eq!(out.provenance, Provenance::StaleFallback);
        assert!(out.status.unwrap().is_rate_limited());
        assert!(matches!(out.error, Some(SourceError::SourceUnavailable { .. })));
    }

    #[test]
    fn test_failure_without_cache_is_empty() {
        let f = fixture(10);
        f.source.push(FetchResponse::failed(None, "connection refused"));
        let out = f.gateway.fetch(&f.source, &FetchQuery::new("rust", 20));
        assert_eq!(out.provenance, Provenance::Empty);
        assert!(out.items.is_empty());
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let f = fixture(10);
        f.source.push(FetchResponse {
            items: vec![],
            status: FetchStatus::transient(Some(503), "service unavailable"),
        });
        f.source.push_articles(&["https://a.test/1"]);

        let out = f.gateway.fetch(&f.source, &FetchQuery::new("rust", 20));
        assert_eq!(out.provenance, Provenance::Fresh);
        assert_eq!(out.items.len(), 1);
        assert_eq!(f.source.calls(), 2);
        assert_eq!(f.gateway.limiter().used("fake"), 2);
    }

    #[test]
    fn test_retries_spend_quota() {
        let f = fixture(2);
        for _ in 0..4 {
            f.source.push(FetchResponse {
                items: vec![],
                status: FetchStatus::transient(Some(503), "service unavailable"),
            });
        }

        let out = f.gateway.fetch(&f.source, &FetchQuery::new("rust", 20));
        assert_eq!(f.source.calls(), 2);
        assert_eq!(f.gateway.limiter().used("fake"), 2);
        assert_eq!(out.provenance, Provenance::Empty);
        assert!(matches!(out.error, Some(SourceError::QuotaExceeded { .. })));
        assert_eq!(out.status.unwrap().http_status, Some(503));
    }

    #[test]
    fn test_retry_waits_for_min_interval() {
        let clock = Arc::new(ManualClock::at("2024-05-01T10:00:00Z"));
        let limiter = Arc::new(RateLimiter::new(clock.clone()));
        limiter.register(
            "fake",
            SourceBudget {
                daily_quota: 10,
                min_interval: Duration::from_secs(3),
            },
        );
        let cache = Arc::new(ResponseCache::new(clock.clone(), Duration::from_secs(3600), 100));
        let gateway = SourceGateway::new(cache, limiter, clock.clone(), 1);
        let source = FakeSource::new("fake", SourceType::News);
        source.push(FetchResponse {
            items: vec![],
            status: FetchStatus::transient(None, "connection reset"),
        });
        source.push(FetchResponse {
            items: vec![],
            status: FetchStatus::transient(None, "connection reset"),
        });

        let start = clock.now();
        let out = gateway.fetch(&source, &FetchQuery::new("rust", 20));
        assert_eq!(source.calls(), 2);
        assert!(matches!(out.error, Some(SourceError::SourceUnavailable { .. })));

        // backoff alone is under 1.5s, the limiter tops it up to the spacing
        let waited = (clock.now() - start).to_std().unwrap();
        assert!(waited >= Duration::from_secs(3), "{waited:?}");
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        let f = fixture(10);
        f.source.push(FetchResponse::failed(Some(401), "bad key"));
        let out = f.gateway.fetch(&f.source, &FetchQuery::new("rust", 20));
        assert_eq!(out.provenance, Provenance::Empty);
        assert_eq!(f.source.calls(), 1);
    }
}
