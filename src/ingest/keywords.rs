//! Keyword derivation for targeted fetches.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::content::{ContentItem, Module};

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "and", "are", "been", "being", "between", "both", "but", "can",
    "could", "does", "each", "for", "from", "have", "into", "its", "just", "more", "most", "not",
    "only", "other", "over", "such", "than", "that", "their", "them", "then", "there", "these",
    "they", "this", "those", "through", "under", "used", "using", "very", "what", "when", "where",
    "which", "while", "will", "with", "within", "would", "your",
];

/// Module keywords count this many times against a single name or
/// description mention.
const KEYWORD_WEIGHT: usize = 3;

/// Words shorter than this carry little signal in names and descriptions.
const MIN_WORD_LEN: usize = 4;

static TRENDING_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Za-z][A-Za-z]{3,}\b").unwrap());

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Lowercased words, stripped of surrounding punctuation.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Counts in first-seen order, then sorts by count; ties keep first-seen order.
struct Tally {
    order: Vec<String>,
    counts: HashMap<String, usize>,
}

impl Tally {
    fn new() -> Self {
        Self {
            order: vec![],
            counts: HashMap::new(),
        }
    }

    fn add(&mut self, word: String, times: usize) {
        match self.counts.get_mut(&word) {
            Some(n) => *n += times,
            None => {
                self.counts.insert(word.clone(), times);
                self.order.push(word);
            }
        }
    }

    fn top(self, n: usize) -> Vec<String> {
        let Tally { order, counts } = self;
        let mut ranked: Vec<(usize, String)> = order
            .into_iter()
            .map(|w| (counts.get(&w).copied().unwrap_or(0), w))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.into_iter().take(n).map(|(_, w)| w).collect()
    }
}

/// Ranked keyword list for a module: name words, description words minus
/// stop words, and the module's own keywords weighted higher.
pub fn rank_module_keywords(module: &Module, top_n: usize) -> Vec<String> {
    let mut tally = Tally::new();

    for word in tokenize(&module.name) {
        if word.chars().count() >= MIN_WORD_LEN {
            tally.add(word, 1);
        }
    }
    for word in tokenize(&module.description) {
        if word.chars().count() >= MIN_WORD_LEN && !is_stop_word(&word) {
            tally.add(word, 1);
        }
    }
    for keyword in &module.keywords {
        let keyword = keyword.trim().to_lowercase();
        if !keyword.is_empty() {
            tally.add(keyword, KEYWORD_WEIGHT);
        }
    }

    tally.top(top_n)
}

/// Overlapping query groups: the top five, the next five, and the module
/// name with the top three. Groups that would be too thin are left out.
pub fn keyword_groups(module_name: &str, ranked: &[String]) -> Vec<Vec<String>> {
    let mut groups = vec![];

    if ranked.len() >= 5 {
        groups.push(ranked[..5].to_vec());
    }
    if ranked.len() >= 10 {
        groups.push(ranked[5..10].to_vec());
    }
    let name = module_name.trim();
    if !name.is_empty() && ranked.len() >= 3 {
        let mut group = vec![name.to_string()];
        group.extend(ranked[..3].iter().cloned());
        groups.push(group);
    }

    groups
}

/// Most frequent words across the titles and descriptions of `items`.
pub fn trending_keywords(items: &[ContentItem], top_n: usize) -> Vec<String> {
    let mut tally = Tally::new();

    for item in items {
        for text in [&item.title, &item.description] {
            for m in TRENDING_WORD.find_iter(text) {
                let word = m.as_str().to_lowercase();
                if !is_stop_word(&word) {
                    tally.add(word, 1);
                }
            }
        }
    }

    tally.top(top_n)
}
