use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler in the background and serve the JSON API.
    Daemon {},

    /// Run the scheduler in the foreground without the API.
    Run {
        /// Run every task once, then exit
        #[clap(long, default_value = "false")]
        once: bool,
    },

    /// Manage curriculum modules
    Modules {
        #[command(subcommand)]
        action: ModulesAction,
    },

    /// Fetch content now, for one module or a keyword list
    Ingest {
        /// Module id or code
        #[clap(short, long, conflicts_with = "keywords")]
        module: Option<String>,

        /// Comma-separated keywords
        #[clap(short, long, required_unless_present = "module")]
        keywords: Option<String>,
    },

    /// Ranked content for a module or a set of modules
    Recommend {
        /// Module id or code
        #[clap(short, long, conflicts_with = "modules")]
        module: Option<String>,

        /// Comma-separated module ids or codes, deduplicated across modules
        #[clap(long, required_unless_present = "module")]
        modules: Option<String>,

        #[clap(short, long, default_value = "10")]
        limit: usize,

        /// Override the configured relevance threshold
        #[clap(short, long)]
        threshold: Option<f32>,
    },

    /// Most-interacted content in the trending window
    Trending {
        #[clap(short, long, default_value = "10")]
        limit: usize,
    },

    /// Score pending module/content pairs, or everything with --full
    Recompute {
        #[clap(long, default_value = "false")]
        full: bool,
    },

    /// Task runs, cache size and quota usage
    Status {},
}

#[derive(Subcommand, Debug)]
pub enum ModulesAction {
    /// Upsert module definitions from a YAML file, keyed by code
    Sync {
        /// YAML list of {code, name, description, keywords}
        file: PathBuf,
    },
    /// List modules with their embedding status
    List {},
}

impl Command {
    /// Commands that write engine files take the base directory lock.
    pub fn is_mutating(&self) -> bool {
        match self {
            Command::Daemon {}
            | Command::Run { .. }
            | Command::Ingest { .. }
            | Command::Recompute { .. } => true,
            Command::Modules { action } => matches!(action, ModulesAction::Sync { .. }),
            Command::Recommend { .. } | Command::Trending { .. } | Command::Status {} => false,
        }
    }
}

/// Splits a comma-separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
