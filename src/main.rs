use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod clock;
mod config;
mod content;
mod eid;
mod ingest;
mod lock;
mod semantic;
mod sources;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::{Engine, EngineFactory, IngestTarget, Scheduler};
use cli::{split_list, Command, ModulesAction};
use content::ModuleDefinition;
use lock::LockGuard;

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn resolve_modules(engine: &Engine, ids_or_codes: &[String]) -> anyhow::Result<Vec<u64>> {
    ids_or_codes
        .iter()
        .map(|m| engine.resolve_module(m).map(|m| m.id).map_err(Into::into))
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let config = EngineFactory::load_config()?;
    let _lock = LockGuard::acquire(config.base_path(), args.command.is_mutating())
        .context("another syllabuzz process is using this base directory")?;

    let scheduler_config = config.scheduler.clone();
    let engine = Arc::new(EngineFactory::create_engine(config)?);

    match args.command {
        Command::Daemon {} => {
            let scheduler =
                Scheduler::new(engine.clone(), engine.state_store(), engine.clock(), &scheduler_config);
            let handle = scheduler.spawn()?;
            web::start_daemon(engine, handle)
        }

        Command::Run { once } => {
            let mut scheduler =
                Scheduler::new(engine.clone(), engine.state_store(), engine.clock(), &scheduler_config);
            if once {
                let ran = scheduler.tick();
                print_json(&ran)?;
                return Ok(());
            }

            let (tx, rx) = std::sync::mpsc::channel();
            ctrlc::set_handler(move || {
                let _ = tx.send(());
            })
            .context("failed to install Ctrl+C handler")?;
            scheduler.run(rx);
            Ok(())
        }

        Command::Modules { action } => match action {
            ModulesAction::Sync { file } => {
                let data = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let definitions: Vec<ModuleDefinition> =
                    serde_yml::from_str(&data).context("module file is malformed")?;
                let report = engine.sync_modules(definitions)?;
                print_json(&report)
            }
            ModulesAction::List {} => print_json(&engine.list_modules()),
        },

        Command::Ingest { module, keywords } => {
            let target = match (module, keywords) {
                (Some(module), _) => IngestTarget::Module {
                    module_id: engine.resolve_module(&module)?.id,
                },
                (None, Some(keywords)) => IngestTarget::Keywords {
                    keywords: split_list(&keywords),
                },
                (None, None) => anyhow::bail!("either --module or --keywords is required"),
            };
            let report = engine.trigger_ingestion(target)?;
            print_json(&report)
        }

        Command::Recommend {
            module,
            modules,
            limit,
            threshold,
        } => match (module, modules) {
            (Some(module), _) => {
                let id = engine.resolve_module(&module)?.id;
                print_json(&engine.recommend_for_module(id, limit, threshold)?)
            }
            (None, Some(modules)) => {
                let ids = resolve_modules(&engine, &split_list(&modules))?;
                print_json(&engine.recommend_for_user(&ids, limit))
            }
            (None, None) => anyhow::bail!("either --module or --modules is required"),
        },

        Command::Trending { limit } => print_json(&engine.trending_content(limit)?),

        Command::Recompute { full } => {
            if !full {
                let (modules, contents) = engine.refresh_embeddings()?;
                let scored = engine.recompute_incremental()?;
                return print_json(&serde_json::json!({
                    "modules_embedded": modules,
                    "contents_embedded": contents,
                    "scored": scored,
                }));
            }

            let bar = ProgressBar::new(engine.contents().embedded_count() as u64);
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} items")?
                    .progress_chars("=> "),
            );
            let report = engine.recompute_full(|chunk| bar.inc(chunk.contents as u64))?;
            bar.finish_and_clear();
            print_json(&report)
        }

        Command::Status {} => print_json(&engine.get_engine_status()),
    }
}
