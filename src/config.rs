use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model (384-dimensional sentence embeddings)
const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
/// Default minimum relevance score for recommendations
const DEFAULT_RELEVANCE_THRESHOLD: f32 = 0.3;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const NEWS_API_KEY_ENV: &str = "NEWS_API_KEY";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    pub model: String,
    /// Timeout for model download in seconds
    pub download_timeout_secs: u64,
    /// Texts per embedding batch
    pub batch_size: usize,
    /// Characters of body text fed to the model per content item
    pub max_body_chars: usize,
    /// Items changed within this many days count as recent for refresh
    pub refresh_window_days: i64,
    /// Upper bound of items embedded per refresh run
    pub refresh_limit: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            batch_size: 64,
            max_body_chars: 1000,
            refresh_window_days: 7,
            refresh_limit: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    /// Minimum score a record needs to be recommended, in [-1.0, 1.0]
    pub threshold: f32,
    /// Content items scored per full-recompute chunk
    pub full_recompute_chunk: usize,
    /// Hours between the start of two full-recompute passes
    pub full_recompute_interval_hours: u64,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_RELEVANCE_THRESHOLD,
            full_recompute_chunk: 300,
            full_recompute_interval_hours: 24,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    pub broad_ingestion_mins: u64,
    pub module_ingestion_mins: u64,
    pub embedding_refresh_mins: u64,
    pub relevance_mins: u64,
    pub maintenance_mins: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 1,
            broad_ingestion_mins: 24 * 60,
            module_ingestion_mins: 12 * 60,
            embedding_refresh_mins: 15,
            relevance_mins: 60,
            maintenance_mins: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsSourceConfig {
    pub enabled: bool,
    /// Overridden by $NEWS_API_KEY
    pub api_key: Option<String>,
    pub base_url: String,
    pub language: String,
    /// Country for category headlines
    pub country: String,
    pub daily_quota: u32,
    pub min_interval_ms: u64,
    pub recency_days: i64,
    /// ANDed onto every keyword query to keep results on-topic
    pub context_terms: Vec<String>,
}

impl Default for NewsSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://newsapi.org/v2".to_string(),
            language: "en".to_string(),
            country: "us".to_string(),
            daily_quota: 100,
            min_interval_ms: 1000,
            recency_days: 30,
            context_terms: [
                "programming",
                "software",
                "technology",
                "algorithm",
                "data",
                "computer",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArxivSourceConfig {
    pub enabled: bool,
    pub base_url: String,
    pub daily_quota: u32,
    pub min_interval_ms: u64,
    pub recency_years: i64,
}

impl Default for ArxivSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://export.arxiv.org/api/query".to_string(),
            daily_quota: 2000,
            min_interval_ms: 3000,
            recency_years: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub request_timeout_secs: u64,
    pub max_retries: u8,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub news: NewsSourceConfig,
    pub arxiv: ArxivSourceConfig,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_retries: 3,
            cache_ttl_secs: 3600,
            cache_max_entries: 100,
            news: NewsSourceConfig::default(),
            arxiv: ArxivSourceConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Broad news topics, one query each
    pub news_categories: Vec<String>,
    /// arXiv category codes, one query each
    pub arxiv_categories: Vec<String>,
    /// Fixed keyword list for broad topical coverage
    pub general_keywords: Vec<String>,
    pub category_fetch_count: usize,
    pub arxiv_category_fetch_count: usize,
    pub keyword_fetch_count: usize,
    pub module_fetch_count: usize,
    /// Ranked keywords kept per module before grouping
    pub module_top_keywords: usize,
    pub trending_enabled: bool,
    pub trending_window_days: i64,
    /// Most-interacted content items mined for trending keywords
    pub trending_top_content: usize,
    pub trending_keywords: usize,
    pub trending_fetch_count: usize,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            news_categories: strings(&["technology", "science", "education", "business"]),
            arxiv_categories: strings(&[
                "cs.AI", "cs.CL", "cs.LG", "cs.CV", "cs.DS", "cs.SE", "cs.DB", "cs.CR", "cs.NE",
                "cs.DC", "cs.HC", "cs.IR", "cs.PL", "cs.NI", "cs.OS", "cs.RO", "cs.AR", "cs.CC",
                "stat.ML",
            ]),
            general_keywords: strings(&[
                "programming",
                "algorithm",
                "data structure",
                "software engineering",
                "artificial intelligence",
                "machine learning",
                "deep learning",
                "neural network",
                "computer science",
                "web development",
                "database",
                "data science",
                "cybersecurity",
                "encryption",
                "operating system",
                "distributed systems",
                "cloud computing",
                "blockchain",
                "quantum computing",
            ]),
            category_fetch_count: 20,
            arxiv_category_fetch_count: 15,
            keyword_fetch_count: 30,
            module_fetch_count: 25,
            module_top_keywords: 10,
            trending_enabled: true,
            trending_window_days: 7,
            trending_top_content: 50,
            trending_keywords: 5,
            trending_fetch_count: 25,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.model.trim().is_empty() {
            bail!("embedding.model must not be empty");
        }
        if self.embedding.download_timeout_secs == 0 {
            bail!("embedding.download_timeout_secs must be greater than 0");
        }
        if self.embedding.batch_size == 0 || self.embedding.refresh_limit == 0 {
            bail!("embedding.batch_size and embedding.refresh_limit must be greater than 0");
        }

        let threshold = self.relevance.threshold;
        if !(-1.0..=1.0).contains(&threshold) {
            bail!("relevance.threshold must be between -1.0 and 1.0, got {threshold}");
        }
        if self.relevance.full_recompute_chunk == 0 {
            bail!("relevance.full_recompute_chunk must be greater than 0");
        }

        let sched = &self.scheduler;
        if sched.tick_secs == 0
            || sched.broad_ingestion_mins == 0
            || sched.module_ingestion_mins == 0
            || sched.embedding_refresh_mins == 0
            || sched.relevance_mins == 0
            || sched.maintenance_mins == 0
        {
            bail!("scheduler intervals must be greater than 0");
        }

        if self.sources.news.daily_quota == 0 || self.sources.arxiv.daily_quota == 0 {
            bail!("sources daily_quota must be greater than 0");
        }
        if self.sources.request_timeout_secs == 0 {
            bail!("sources.request_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Loads `config.yaml` from `base_path`, creating it with defaults when missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path).context("failed to open config directory")?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_FILE)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;
        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// News API key, with the environment taking precedence over the file.
    pub fn news_api_key(&self) -> Option<String> {
        std::env::var(NEWS_API_KEY_ENV)
            .ok()
            .or_else(|| self.sources.news.api_key.clone())
            .filter(|key| !key.trim().is_empty())
    }

    #[cfg(test)]
    pub fn for_tests(base_path: &Path) -> Self {
        Self {
            base_path: base_path.to_path_buf(),
            ..Default::default()
        }
    }
}
