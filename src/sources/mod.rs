//! External content providers and the resilience layer in front of them.
//!
//! - `news`, `arxiv`: one `SourceClient` per provider, fetch + parse only
//! - `http`: blocking GET, one attempt, transient failures flagged
//! - `ratelimit`: per-source spacing and daily quota
//! - `cache`: TTL response cache with stale fallback
//! - `gateway`: cache -> quota -> fetch (retried, each attempt through the
//!   quota) -> fallback, the only path the ingestion code uses

pub mod arxiv;
mod cache;
mod gateway;
mod http;
pub mod news;
mod ratelimit;

pub use cache::{CacheLookup, ResponseCache};
pub use gateway::{FetchOutcome, Provenance, SourceGateway};
pub use http::HttpClient;
pub use ratelimit::{Permit, QuotaSnapshot, RateLimiter, SourceBudget};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::SourceType;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("{source_name} unavailable: {message}")]
    SourceUnavailable { source_name: String, message: String },

    #[error("{source_name} daily quota exceeded")]
    QuotaExceeded { source_name: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchQuery {
    pub query: String,
    /// Provider category to browse instead of a free-text search
    pub category: Option<String>,
    pub max_results: usize,
    /// 1-based page
    pub page: usize,
    pub recency_window: Option<chrono::Duration>,
}

impl FetchQuery {
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            max_results,
            page: 1,
            recency_window: None,
            category: None,
        }
    }

    /// Browse a provider category (news top headlines) rather than search.
    pub fn category(category: impl Into<String>, max_results: usize) -> Self {
        let category = category.into();
        Self {
            query: category.clone(),
            category: Some(category),
            ..Self::new("", max_results)
        }
    }

    pub fn with_recency(mut self, window: Option<chrono::Duration>) -> Self {
        self.recency_window = window;
        self
    }

    /// Cache key for the exact request.
    pub fn cache_key(&self, source: &str) -> String {
        format!(
            "{}|{}|{}|{}",
            self.similar_prefix(source),
            self.page,
            self.max_results,
            self.recency_window.map(|w| w.num_days()).unwrap_or(0)
        )
    }

    /// Key prefix shared by requests that differ only in paging or size.
    /// Category browsing and searches never share a prefix.
    pub fn similar_prefix(&self, source: &str) -> String {
        match &self.category {
            Some(category) => format!("{}|category:{}", source, category.trim().to_lowercase()),
            None => format!("{}|{}", source, self.query.trim().to_lowercase()),
        }
    }
}

/// Outcome of one provider call. Transient failures are reported here
/// instead of as errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FetchStatus {
    pub success: bool,
    pub http_status: Option<u16>,
    pub message: String,
    /// Worth another attempt: connect errors, timeouts, 5xx
    #[serde(skip)]
    pub transient: bool,
}

impl FetchStatus {
    pub fn ok(http_status: u16) -> Self {
        Self {
            success: true,
            http_status: Some(http_status),
            message: String::new(),
            transient: false,
        }
    }

    pub fn failed(http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            http_status,
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::failed(http_status, message)
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.http_status == Some(429)
    }
}

#[derive(Clone, Debug)]
pub struct FetchResponse {
    pub items: Vec<RawItem>,
    pub status: FetchStatus,
}

impl FetchResponse {
    pub fn failed(http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            items: vec![],
            status: FetchStatus::failed(http_status, message),
        }
    }
}

/// News article as returned by the news provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub source_name: String,
    pub author: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content: Option<String>,
}

/// Paper entry from the arXiv Atom feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArxivPaper {
    /// arXiv id including version, e.g. `2401.01234v2`
    pub arxiv_id: String,
    pub title: String,
    pub summary: String,
    pub authors: Vec<String>,
    /// Primary category first
    pub categories: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawItem {
    News(NewsArticle),
    Paper(ArxivPaper),
}

pub trait SourceClient: Send + Sync {
    fn name(&self) -> &str;

    fn source_type(&self) -> SourceType;

    /// Provider query string for a keyword set.
    fn build_query(&self, keywords: &[String]) -> String;

    /// Fetch one page. Never fails: transport and provider errors come back
    /// as an empty item list with `status.success == false`.
    fn fetch(&self, query: &FetchQuery) -> FetchResponse;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similar_prefix_ignores_paging() {
        let a = FetchQuery::new("Machine Learning", 20);
        let mut b = FetchQuery::new("machine learning ", 50);
        b.page = 3;

        assert_eq!(a.similar_prefix("news"), b.similar_prefix("news"));
        assert_ne!(a.cache_key("news"), b.cache_key("news"));
        assert_ne!(a.similar_prefix("news"), a.similar_prefix("arxiv"));
    }

    #[test]
    fn test_category_prefix_is_separate_from_search() {
        let browse = FetchQuery::category("Technology", 20);
        let mut page3 = FetchQuery::category("technology", 50);
        page3.page = 3;
        let search = FetchQuery::new("technology", 20);

        assert_eq!(browse.similar_prefix("news"), page3.similar_prefix("news"));
        assert_ne!(browse.similar_prefix("news"), search.similar_prefix("news"));
        assert_ne!(browse.cache_key("news"), search.cache_key("news"));
    }
}
