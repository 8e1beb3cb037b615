//! Provider items to store records.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::content::{NewContent, SourceType};
use crate::semantic::truncate_with_ellipsis;
use crate::sources::arxiv::strip_version;
use crate::sources::{ArxivPaper, NewsArticle, RawItem};

const ARXIV_DESCRIPTION_CHARS: usize = 300;

static TRUNCATION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*…?\s*\[\+\d+ chars\]\s*$").unwrap());

/// Canonical form used as the dedup key: no fragment, lowercase host,
/// no trailing slash on a bare path. Unparseable input is kept as-is.
pub fn canonical_url(raw: &str) -> String {
    let raw = raw.trim();
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            let mut s = url.to_string();
            if url.path() == "/" && url.query().is_none() {
                s.truncate(s.trim_end_matches('/').len());
            }
            s
        }
        Err(_) => raw.to_string(),
    }
}

pub fn normalize(item: RawItem, category: Option<&str>) -> Option<NewContent> {
    match item {
        RawItem::News(article) => normalize_article(article, category),
        RawItem::Paper(paper) => normalize_paper(paper),
    }
}

fn normalize_article(article: NewsArticle, category: Option<&str>) -> Option<NewContent> {
    let url = canonical_url(&article.url);
    if url.is_empty() || article.title.trim().is_empty() {
        return None;
    }

    let body = article
        .content
        .map(|c| TRUNCATION_MARKER.replace(&c, "").trim().to_string())
        .unwrap_or_default();

    Some(NewContent {
        natural_key: url.clone(),
        title: article.title,
        description: article.description.unwrap_or_default(),
        body_excerpt: body,
        url,
        source_name: article.source_name,
        source_type: SourceType::News,
        categories: category.map(|c| c.to_lowercase()).into_iter().collect(),
        authors: article.author.into_iter().collect(),
        published_at: article.published_at,
    })
}

fn normalize_paper(paper: ArxivPaper) -> Option<NewContent> {
    let id = strip_version(paper.arxiv_id.trim());
    if id.is_empty() || paper.title.trim().is_empty() {
        return None;
    }

    Some(NewContent {
        natural_key: format!("arxiv:{id}"),
        title: paper.title,
        description: truncate_with_ellipsis(&paper.summary, ARXIV_DESCRIPTION_CHARS),
        body_excerpt: paper.summary,
        url: format!("https://arxiv.org/abs/{id}"),
        source_name: "arXiv".to_string(),
        source_type: SourceType::Academic,
        categories: paper.categories.into_iter().collect(),
        authors: paper.authors,
        published_at: paper.published_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fake::article;

    #[test]
    fn test_canonical_url() {
        assert_eq!(
            canonical_url("https://Example.COM/news/story?id=3#comments"),
            "https://example.com/news/story?id=3"
        );
        assert_eq!(canonical_url("https://example.com/"), "https://example.com");
        assert_eq!(canonical_url(" not a url "), "not a url");
    }

    #[test]
    fn test_article_strips_truncation_marker() {
        let mut a = article("https://example.com/a#top");
        a.content = Some("The release adds async traits… [+2140 chars]".to_string());
        let c = normalize(RawItem::News(a), Some("Technology")).unwrap();

        assert_eq!(c.natural_key, "https://example.com/a");
        assert_eq!(c.body_excerpt, "The release adds async traits");
        assert!(c.categories.contains("technology"));
        assert_eq!(c.source_type, SourceType::News);
    }

    #[test]
    fn test_paper_key_ignores_version() {
        let paper = ArxivPaper {
            arxiv_id: "2401.01234v3".to_string(),
            title: "Sparse Attention".to_string(),
            summary: "x".repeat(400),
            authors: vec!["Ada".to_string()],
            categories: vec!["cs.CL".to_string(), "cs.AI".to_string()],
            published_at: None,
        };
        let c = normalize(RawItem::Paper(paper), None).unwrap();

        assert_eq!(c.natural_key, "arxiv:2401.01234");
        assert_eq!(c.url, "https://arxiv.org/abs/2401.01234");
        assert!(c.description.ends_with("..."));
        assert_eq!(c.description.chars().count(), 303);
        assert_eq!(c.categories.len(), 2);
    }
}
