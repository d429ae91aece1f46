//! `steroids init` - initialize the project task store.

use anyhow::Result;
use clap::ArgMatches;
use serde_json::json;
use steroids_core::paths::GlobalPaths;
use steroids_core::{GlobalStore, TaskStore};

use crate::output;

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    let project_root = super::project_root(matches)?;
    TaskStore::open(&project_root).await?;

    let global_paths = GlobalPaths::resolve()?;
    let global = GlobalStore::open(&global_paths.db_path()).await?;
    global
        .register_project(&project_root.display().to_string())
        .await?;

    output::emit(
        json,
        &format!("Initialized task store in {}", project_root.display()),
        &json!({ "project": project_root.display().to_string() }),
    );
    Ok(())
}
