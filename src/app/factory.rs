use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::app::engine::Engine;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::semantic::{Embedder, FastEmbedder};
use crate::sources::arxiv::ArxivClient;
use crate::sources::news::NewsApiClient;
use crate::sources::{HttpClient, SourceClient};

/// Builds the engine and its collaborators from the environment.
pub struct EngineFactory;

impl EngineFactory {
    /// `$SYLLABUZZ_BASE_PATH`, else `~/.local/share/syllabuzz`. Created if missing.
    pub fn base_path() -> Result<PathBuf> {
        let base_path = match std::env::var("SYLLABUZZ_BASE_PATH") {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => {
                let home = my_home()
                    .context("Could not determine home directory")?
                    .context("Home directory path is empty")?;
                home.join(".local/share/syllabuzz")
            }
        };

        std::fs::create_dir_all(&base_path).context("Failed to create application base directory")?;
        Ok(base_path)
    }

    pub fn load_config() -> Result<Config> {
        let base_path = Self::base_path()?;
        Config::load_with(&base_path)
    }

    /// Source clients enabled by config. A source missing its API key is
    /// left out with a warning.
    pub fn create_clients(config: &Config, clock: Arc<dyn Clock>) -> Result<Vec<Arc<dyn SourceClient>>> {
        let sources = &config.sources;
        let http = Arc::new(
            HttpClient::new(Duration::from_secs(sources.request_timeout_secs))
                .context("Failed to build HTTP client")?,
        );

        let mut clients: Vec<Arc<dyn SourceClient>> = vec![];

        if sources.news.enabled {
            match config.news_api_key() {
                Some(key) => clients.push(Arc::new(NewsApiClient::new(
                    http.clone(),
                    clock.clone(),
                    key,
                    &sources.news,
                ))),
                None => log::warn!("news source disabled: no API key (set NEWS_API_KEY or sources.news.api_key)"),
            }
        }

        if sources.arxiv.enabled {
            clients.push(Arc::new(ArxivClient::new(http, clock, &sources.arxiv)));
        }

        if clients.is_empty() {
            log::warn!("no content sources enabled, ingestion will be a no-op");
        }

        Ok(clients)
    }

    pub fn create_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
        let embedding = &config.embedding;
        let embedder = FastEmbedder::new(
            &embedding.model,
            config.base_path().to_path_buf(),
            Duration::from_secs(embedding.download_timeout_secs),
            embedding.batch_size,
        )?;
        Ok(Arc::new(embedder))
    }

    pub fn create_engine(config: Config) -> Result<Engine> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let clients = Self::create_clients(&config, clock.clone())?;
        let embedder = Self::create_embedder(&config)?;
        Ok(Engine::open(config, clients, embedder, clock)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_news_without_key_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(tmp.path());
        config.sources.news.enabled = true;
        config.sources.news.api_key = None;
        config.sources.arxiv.enabled = true;

        // NEWS_API_KEY in the environment would override the config
        if std::env::var("NEWS_API_KEY").map(|k| !k.trim().is_empty()).unwrap_or(false) {
            return;
        }

        let clients = EngineFactory::create_clients(&config, Arc::new(SystemClock)).unwrap();
        let names: Vec<&str> = clients.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["arxiv"]);
    }

    #[test]
    fn test_unknown_model_fails_early() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(tmp.path());
        config.embedding.model = "no-such-model".to_string();
        assert!(EngineFactory::create_embedder(&config).is_err());
    }
}
