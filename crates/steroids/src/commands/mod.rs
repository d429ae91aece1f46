//! CLI command implementations.

pub mod ai;
pub mod cleanup;
pub mod init;
pub mod merge;
pub mod runners;
pub mod sections;
pub mod task_loop;
pub mod tasks;
pub mod wakeup;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ArgMatches;
use steroids_core::config::Config;
use steroids_core::paths::GlobalPaths;
use steroids_core::provider::ProviderRegistry;
use steroids_core::{GlobalStore, TaskStore};

/// Resolve the project directory from `--project` or the cwd.
pub fn project_root(matches: &ArgMatches) -> Result<PathBuf> {
    match matches.get_one::<String>("project") {
        Some(path) => Ok(PathBuf::from(path)),
        None => std::env::current_dir().context("cannot resolve current directory"),
    }
}

/// Everything most commands need: resolved paths, config, and stores.
pub struct CommandContext {
    /// Project checkout directory.
    pub project_root: PathBuf,
    /// Global state layout.
    pub global_paths: GlobalPaths,
    /// Layered configuration.
    pub config: Config,
    /// Project task store.
    pub store: TaskStore,
    /// Host control plane.
    pub global: GlobalStore,
    /// Provider registry with built-in adapters.
    pub registry: ProviderRegistry,
}

impl CommandContext {
    /// Open stores for an already-initialized project.
    pub async fn open(matches: &ArgMatches) -> Result<Self> {
        let project_root = project_root(matches)?;
        let global_paths = GlobalPaths::resolve()?;
        let config = Config::load(&project_root, &global_paths)?;
        let store = TaskStore::open_existing(&project_root).await?;
        let global = GlobalStore::open(&global_paths.db_path()).await?;
        let registry = ProviderRegistry::with_builtins(config.provider.default_provider.clone());
        Ok(Self {
            project_root,
            global_paths,
            config,
            store,
            global,
            registry,
        })
    }
}
