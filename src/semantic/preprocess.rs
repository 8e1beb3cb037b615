//! Builds embedding input text and change-detection hashes.

use sha2::{Digest, Sha256};

const TRUNCATION_SUFFIX: &str = "...";

/// Text embedded for a content item: title, description and the first
/// `max_body_chars` characters of the body, space separated.
///
/// Returns `None` when every field is blank.
pub fn content_text(title: &str, description: &str, body: &str, max_body_chars: usize) -> Option<String> {
    let body: String = body.trim().chars().take(max_body_chars).collect();
    join_non_empty(&[title, description, &body])
}

/// Text embedded for a module: description followed by its keywords.
pub fn module_text(description: &str, keywords: &[String]) -> Option<String> {
    let keywords = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    join_non_empty(&[description, &keywords])
}

fn join_non_empty(parts: &[&str]) -> Option<String> {
    let parts: Vec<&str> = parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Truncate to `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}{}", truncated.trim_end(), TRUNCATION_SUFFIX)
}

/// Stable hash of the text fields that feed an embedding.
///
/// First 8 bytes of SHA-256 over the trimmed fields, unit-separator joined,
/// so the value survives rebuilds and can be persisted next to vectors.
pub fn text_hash(fields: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(field.trim().as_bytes());
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_content_returns_none() {
        assert!(content_text("", "  ", "\n\t", 1000).is_none());
        assert!(module_text("   ", &[" ".to_string()]).is_none());
    }

    #[test]
    fn test_content_text_bounds_body() {
        let body = "b".repeat(5000);
        let text = content_text("Title", "Desc", &body, 1000).unwrap();
        assert!(text.starts_with("Title Desc "));
        assert_eq!(text.len(), "Title Desc ".len() + 1000);
    }

    #[test]
    fn test_module_text_joins_keywords() {
        let keywords = vec!["graphs".to_string(), " sorting ".to_string()];
        assert_eq!(
            module_text("Algorithms course", &keywords).unwrap(),
            "Algorithms course graphs, sorting"
        );
        assert_eq!(module_text("", &keywords).unwrap(), "graphs, sorting");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("short", 300), "short");
        let long = "word ".repeat(100);
        let cut = truncate_with_ellipsis(&long, 300);
        assert!(cut.ends_with("..."));
        assert!(cut.chars().count() <= 303);
    }

    #[test]
    fn test_text_hash_is_stable_and_trims() {
        assert_eq!(text_hash(&["Title", "Desc"]), text_hash(&["  Title ", "Desc\n"]));
        assert_ne!(text_hash(&["Title A", "Desc"]), text_hash(&["Title B", "Desc"]));
        // field boundaries matter
        assert_ne!(text_hash(&["ab", "c"]), text_hash(&["a", "bc"]));
    }
}
