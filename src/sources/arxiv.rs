use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::clock::Clock;
use crate::config::ArxivSourceConfig;
use crate::content::SourceType;
use crate::sources::{ArxivPaper, FetchQuery, FetchResponse, FetchStatus, HttpClient, RawItem, SourceClient};

pub const NAME: &str = "arxiv";

/// Responses shorter than this cannot hold a single entry.
const MIN_FEED_LEN: usize = 100;

const TOP_LEVEL_ARCHIVES: &[&str] = &["cs", "stat", "math", "physics"];

static CATEGORY_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z-]+\.[A-Za-z-]+$").unwrap());
static VERSION_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"v\d+$").unwrap());

static ENTRY: Lazy<Selector> = Lazy::new(|| Selector::parse("entry").unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static SUMMARY: Lazy<Selector> = Lazy::new(|| Selector::parse("summary").unwrap());
static ID: Lazy<Selector> = Lazy::new(|| Selector::parse("id").unwrap());
static PUBLISHED: Lazy<Selector> = Lazy::new(|| Selector::parse("published").unwrap());
static AUTHOR_NAME: Lazy<Selector> = Lazy::new(|| Selector::parse("author name").unwrap());
static CATEGORY: Lazy<Selector> = Lazy::new(|| Selector::parse("category[term]").unwrap());

/// arXiv Atom API client.
pub struct ArxivClient {
    http: Arc<HttpClient>,
    clock: Arc<dyn Clock>,
    base_url: String,
    recency_years: i64,
}

impl ArxivClient {
    pub fn new(http: Arc<HttpClient>, clock: Arc<dyn Clock>, config: &ArxivSourceConfig) -> Self {
        Self {
            http,
            clock,
            base_url: config.base_url.clone(),
            recency_years: config.recency_years,
        }
    }
}

impl SourceClient for ArxivClient {
    fn name(&self) -> &str {
        NAME
    }

    fn source_type(&self) -> SourceType {
        SourceType::Academic
    }

    fn build_query(&self, keywords: &[String]) -> String {
        keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(format_search_term)
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    fn fetch(&self, query: &FetchQuery) -> FetchResponse {
        let search_query = if query.query.contains(':') {
            query.query.clone()
        } else {
            format_search_term(query.query.trim())
        };
        let start = (query.page.max(1) - 1) * query.max_results;

        let params = [
            ("search_query", search_query),
            ("start", start.to_string()),
            ("max_results", query.max_results.to_string()),
            ("sortBy", "submittedDate".to_string()),
            ("sortOrder", "descending".to_string()),
        ];

        let body = match self.http.get(&self.base_url, &params, &[]) {
            Ok(body) => body,
            Err(status) => {
                return FetchResponse {
                    items: vec![],
                    status,
                }
            }
        };

        let window = query
            .recency_window
            .unwrap_or_else(|| chrono::Duration::days(365 * self.recency_years));
        let cutoff = self.clock.now() - window;

        let papers = parse_arxiv_feed(&body.body);
        let total = papers.len();
        let kept: Vec<RawItem> = papers
            .into_iter()
            .filter(|p| p.published_at.map(|d| d >= cutoff).unwrap_or(true))
            .take(query.max_results)
            .map(RawItem::Paper)
            .collect();

        if kept.len() < total {
            log::debug!("arxiv: kept {} of {total} papers newer than {cutoff}", kept.len());
        }

        FetchResponse {
            items: kept,
            status: FetchStatus::ok(body.status),
        }
    }
}

/// `cs.AI` and bare archives become `cat:` filters, anything else a
/// full-text term.
pub fn format_search_term(term: &str) -> String {
    if CATEGORY_CODE.is_match(term) || TOP_LEVEL_ARCHIVES.contains(&term) {
        format!("cat:{term}")
    } else if term.contains(char::is_whitespace) {
        format!("all:\"{}\"", term.replace('"', ""))
    } else {
        format!("all:{term}")
    }
}

/// `2401.01234v2` -> `2401.01234`
pub fn strip_version(arxiv_id: &str) -> &str {
    match VERSION_SUFFIX.find(arxiv_id) {
        Some(m) => &arxiv_id[..m.start()],
        None => arxiv_id,
    }
}

fn text_of(el: &ElementRef, selector: &Selector) -> Option<String> {
    let text = el
        .select(selector)
        .next()?
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!text.is_empty()).then_some(text)
}

/// Parses an Atom feed. Anything unreadable yields no papers.
pub fn parse_arxiv_feed(body: &str) -> Vec<ArxivPaper> {
    if body.trim().len() < MIN_FEED_LEN {
        log::debug!("arxiv: response too short to parse ({} bytes)", body.len());
        return vec![];
    }

    let document = Html::parse_document(body);
    let mut papers = vec![];

    for entry in document.select(&ENTRY) {
        let Some(id_url) = text_of(&entry, &ID) else {
            continue;
        };
        // the API reports query errors as a feed entry
        if id_url.contains("/api/errors") {
            log::warn!("arxiv: api error: {}", text_of(&entry, &SUMMARY).unwrap_or_default());
            continue;
        }
        let arxiv_id = match id_url.split_once("/abs/") {
            Some((_, id)) => id.to_string(),
            None => id_url,
        };

        let Some(title) = text_of(&entry, &TITLE) else {
            continue;
        };

        let published_at = text_of(&entry, &PUBLISHED)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc));

        let authors = entry
            .select(&AUTHOR_NAME)
            .map(|n| n.text().collect::<String>().trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();

        let mut categories: Vec<String> = vec![];
        for term in entry.select(&CATEGORY).filter_map(|c| c.value().attr("term")) {
            if !categories.iter().any(|c| c == term) {
                categories.push(term.to_string());
            }
        }

        papers.push(ArxivPaper {
            arxiv_id,
            title,
            summary: text_of(&entry, &SUMMARY).unwrap_or_default(),
            authors,
            categories,
            published_at,
        });
    }

    papers
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="html">ArXiv Query: search_query=cat:cs.AI</title>
  <id>http://arxiv.org/api/abc</id>
  <entry>
    <id>http://arxiv.org/abs/2401.01234v2</id>
    <updated>2024-01-03T10:00:00Z</updated>
    <published>2024-01-02T18:59:59Z</published>
    <title>Sparse   Attention
      for Long Documents</title>
    <summary>  We study attention &amp; memory.
    </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/abs/2401.01234v2" rel="alternate" type="text/html"/>
    <arxiv:primary_category xmlns:arxiv="http://arxiv.org/schemas/atom" term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.CL" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.AI" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/cs/0112017v1</id>
    <published>2001-12-20T00:00:00Z</published>
    <title>An Old Paper</title>
    <summary>Classic.</summary>
    <author><name>Someone</name></author>
    <category term="cs.LO" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed() {
        let papers = parse_arxiv_feed(FEED);
        assert_eq!(papers.len(), 2);

        let p = &papers[0];
        assert_eq!(p.arxiv_id, "2401.01234v2");
        assert_eq!(p.title, "Sparse Attention for Long Documents");
        assert_eq!(p.summary, "We study attention & memory.");
        assert_eq!(p.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(p.categories, vec!["cs.CL", "cs.AI"]);
        assert_eq!(p.published_at.unwrap().to_rfc3339(), "2024-01-02T18:59:59+00:00");

        assert_eq!(papers[1].arxiv_id, "cs/0112017v1");
    }

    #[test]
    fn test_short_or_garbage_body_is_empty() {
        assert!(parse_arxiv_feed("").is_empty());
        assert!(parse_arxiv_feed("<feed></feed>").is_empty());
        assert!(parse_arxiv_feed(&"not xml at all ".repeat(20)).is_empty());
    }

    #[test]
    fn test_api_error_entry_is_skipped() {
        let body = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry>
            <id>http://arxiv.org/api/errors#incorrect_id_format_for_1234</id>
            <title>Error</title>
            <summary>incorrect id format for 1234</summary>
        </entry></feed>"#;
        assert!(parse_arxiv_feed(body).is_empty());
    }

    #[test]
    fn test_search_terms() {
        assert_eq!(format_search_term("cs.AI"), "cat:cs.AI");
        assert_eq!(format_search_term("stat"), "cat:stat");
        assert_eq!(format_search_term("transformers"), "all:transformers");
        assert_eq!(format_search_term("machine learning"), "all:\"machine learning\"");
    }

    #[test]
    fn test_strip_version() {
        assert_eq!(strip_version("2401.01234v2"), "2401.01234");
        assert_eq!(strip_version("cs/0112017v1"), "cs/0112017");
        assert_eq!(strip_version("2401.01234"), "2401.01234");
    }
}
