use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::clock::Clock;
use crate::config::NewsSourceConfig;
use crate::content::SourceType;
use crate::sources::{
    FetchQuery, FetchResponse, FetchStatus, HttpClient, NewsArticle, RawItem, SourceClient,
};

pub const NAME: &str = "newsapi";

/// The provider caps page size at 100.
const MAX_PAGE_SIZE: usize = 100;

/// NewsAPI client. Keyword queries go to `/everything`, category queries
/// to `/top-headlines`.
pub struct NewsApiClient {
    http: Arc<HttpClient>,
    clock: Arc<dyn Clock>,
    api_key: String,
    base_url: String,
    language: String,
    country: String,
    recency_days: i64,
    context_terms: Vec<String>,
}

impl NewsApiClient {
    pub fn new(
        http: Arc<HttpClient>,
        clock: Arc<dyn Clock>,
        api_key: String,
        config: &NewsSourceConfig,
    ) -> Self {
        Self {
            http,
            clock,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            language: config.language.clone(),
            country: config.country.clone(),
            recency_days: config.recency_days,
            context_terms: config.context_terms.clone(),
        }
    }

    fn search_request(&self, query: &FetchQuery) -> (String, Vec<(&'static str, String)>) {
        let window = query
            .recency_window
            .unwrap_or_else(|| chrono::Duration::days(self.recency_days));
        let from = (self.clock.now() - window).format("%Y-%m-%d").to_string();

        let params = vec![
            ("q", query.query.clone()),
            ("language", self.language.clone()),
            ("sortBy", "relevancy".to_string()),
            ("from", from),
            ("page", query.page.max(1).to_string()),
            ("pageSize", page_size(query).to_string()),
        ];
        (format!("{}/everything", self.base_url), params)
    }

    fn headlines_request(&self, category: &str, query: &FetchQuery) -> (String, Vec<(&'static str, String)>) {
        let params = vec![
            ("category", category.trim().to_lowercase()),
            ("country", self.country.clone()),
            ("page", query.page.max(1).to_string()),
            ("pageSize", page_size(query).to_string()),
        ];
        (format!("{}/top-headlines", self.base_url), params)
    }
}

fn page_size(query: &FetchQuery) -> usize {
    query.max_results.clamp(1, MAX_PAGE_SIZE)
}

impl SourceClient for NewsApiClient {
    fn name(&self) -> &str {
        NAME
    }

    fn source_type(&self) -> SourceType {
        SourceType::News
    }

    fn build_query(&self, keywords: &[String]) -> String {
        build_news_query(keywords, &self.context_terms)
    }

    fn fetch(&self, query: &FetchQuery) -> FetchResponse {
        let (url, params) = match &query.category {
            Some(category) => self.headlines_request(category, query),
            None => self.search_request(query),
        };

        let body = match self.http.get(&url, &params, &[("X-Api-Key", &self.api_key)]) {
            Ok(body) => body,
            Err(status) => {
                return FetchResponse {
                    items: vec![],
                    status,
                }
            }
        };

        match parse_news_response(&body.body) {
            Ok(mut articles) => {
                articles.truncate(query.max_results);
                FetchResponse {
                    items: articles.into_iter().map(RawItem::News).collect(),
                    status: FetchStatus::ok(body.status),
                }
            }
            Err(message) => FetchResponse::failed(Some(body.status), message),
        }
    }
}

/// `"kw1" OR "kw2" AND (ctx1 OR ctx2)`. The context clause keeps broad
/// keywords on topic.
pub fn build_news_query(keywords: &[String], context_terms: &[String]) -> String {
    let quoted: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().replace('"', ""))
        .filter(|k| !k.is_empty())
        .map(|k| format!("\"{k}\""))
        .collect();

    let context = context_terms
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| t.trim())
        .collect::<Vec<_>>()
        .join(" OR ");

    match (quoted.is_empty(), context.is_empty()) {
        (true, _) => context,
        (false, true) => quoted.join(" OR "),
        (false, false) => format!("({}) AND ({context})", quoted.join(" OR ")),
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    status: Option<String>,
    message: Option<String>,
    #[serde(default)]
    articles: Vec<ApiArticle>,
}

#[derive(Deserialize)]
struct ApiSource {
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiArticle {
    source: Option<ApiSource>,
    author: Option<String>,
    title: Option<String>,
    description: Option<String>,
    url: Option<String>,
    published_at: Option<String>,
    content: Option<String>,
}

const REMOVED: &str = "[Removed]";

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != REMOVED)
}

/// Malformed bodies count as zero results; only an explicit provider
/// error is reported as `Err`.
pub fn parse_news_response(body: &str) -> Result<Vec<NewsArticle>, String> {
    let resp: ApiResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            log::debug!("newsapi: unparseable response: {e}");
            return Ok(vec![]);
        }
    };

    if resp.status.as_deref() == Some("error") {
        return Err(resp.message.unwrap_or_else(|| "provider error".to_string()));
    }

    let articles = resp
        .articles
        .into_iter()
        .filter_map(|a| {
            let title = non_empty(a.title)?;
            let url = non_empty(a.url)?;
            let published_at = a
                .published_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc));

            Some(NewsArticle {
                source_name: a
                    .source
                    .and_then(|s| non_empty(s.name))
                    .unwrap_or_else(|| "Unknown".to_string()),
                author: non_empty(a.author),
                title,
                description: non_empty(a.description),
                url,
                published_at,
                content: non_empty(a.content),
            })
        })
        .collect();

    Ok(articles)
}
