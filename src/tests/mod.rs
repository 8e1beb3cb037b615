
use std::sync::Arc;

use crate::app::Engine;
use crate::clock::{Clock, ManualClock};
use crate::config::Config;
use crate::content::{ModuleDefinition, NewContent, NewEmbedding, SourceType};
use crate::semantic::embeddings::HashingEmbedder;
use crate::sources::fake::FakeSource;
use crate::sources::{news, SourceClient};

/// An engine on a temp directory with a scripted news source and the
/// hashing embedder. The fake source answers to the real news source name
/// so the configured quota applies to it.
pub struct TestEngine {
    pub tmp: tempfile::TempDir,
    pub clock: Arc<ManualClock>,
    pub news: Arc<FakeSource>,
    pub engine: Arc<Engine>,
}

pub fn config_for(tmp: &tempfile::TempDir) -> Config {
    let mut config = Config::for_tests(tmp.path());
    config.ingestion.news_categories = vec!["technology".to_string()];
    config.ingestion.arxiv_categories = vec![];
    config.ingestion.general_keywords = vec![];
    config.ingestion.trending_enabled = false;
    config.sources.news.min_interval_ms = 0;
    config
}

pub fn open_engine(tmp: &tempfile::TempDir, config: Config, clock: Arc<ManualClock>, news: Arc<FakeSource>) -> Engine {
    Engine::open(
        config,
        vec![news as Arc<dyn SourceClient>],
        Arc::new(HashingEmbedder::new(32)),
        clock,
    )
    .unwrap_or_else(|e| panic!("failed to open engine in {}: {e}", tmp.path().display()))
}

pub fn create_engine_with(configure: impl FnOnce(&mut Config)) -> TestEngine {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = config_for(&tmp);
    configure(&mut config);

    let clock = Arc::new(ManualClock::at("2024-05-01T10:00:00Z"));
    let news = Arc::new(FakeSource::new(news::NAME, SourceType::News));
    let engine = Arc::new(open_engine(&tmp, config, clock.clone(), news.clone()));

    TestEngine {
        tmp,
        clock,
        news,
        engine,
    }
}

pub fn create_engine() -> TestEngine {
    create_engine_with(|_| {})
}

impl TestEngine {
    pub fn module(&self, code: &str, description: &str, keywords: &[&str]) -> u64 {
        self.engine
            .sync_modules(vec![ModuleDefinition {
                code: code.to_string(),
                name: code.to_string(),
                description: description.to_string(),
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
            }])
            .unwrap();
        self.engine.resolve_module(code).unwrap().id
    }

    /// Module with a hand-picked vector instead of a model embedding.
    pub fn module_with_vector(&self, code: &str, vector: Vec<f32>) -> u64 {
        let id = self.module(code, &format!("{code} description"), &[]);
        let text_hash = self.engine.modules().get(id).unwrap().embedding.text_hash;
        self.engine
            .modules()
            .set_embeddings(vec![NewEmbedding { id, text_hash, vector }], self.clock.now())
            .unwrap();
        id
    }

    pub fn content(&self, key: &str, published_at: Option<&str>, vector: Option<Vec<f32>>) -> u64 {
        let published_at = published_at.map(|p| {
            chrono::DateTime::parse_from_rfc3339(p)
                .unwrap()
                .with_timezone(&chrono::Utc)
        });
        let outcome = self
            .engine
            .contents()
            .upsert(
                NewContent {
                    natural_key: key.to_string(),
                    title: key.to_string(),
                    description: String::new(),
                    body_excerpt: String::new(),
                    url: key.to_string(),
                    source_name: "Test Wire".to_string(),
                    source_type: SourceType::News,
                    categories: Default::default(),
                    authors: vec![],
                    published_at,
                },
                self.clock.now(),
            )
            .unwrap();

        if let Some(vector) = vector {
            let text_hash = self.engine.contents().get(outcome.id).unwrap().embedding.text_hash;
            self.engine
                .contents()
                .set_embeddings(
                    vec![NewEmbedding {
                        id: outcome.id,
                        text_hash,
                        vector,
                    }],
                    self.clock.now(),
                )
                .unwrap();
        }
        outcome.id
    }
}
