//! `steroids cleanup` - clean up stale runner records.

use anyhow::Result;
use clap::ArgMatches;
use serde_json::json;
use steroids_core::paths::GlobalPaths;
use steroids_core::GlobalStore;

use crate::output;

pub async fn run(_matches: &ArgMatches, json: bool) -> Result<()> {
    let global_paths = GlobalPaths::resolve()?;
    let global = GlobalStore::open(&global_paths.db_path()).await?;
    let cleaned = global.cleanup_stale_runners().await?;
    output::emit(
        json,
        &format!("Marked {cleaned} stale runner(s) as stopped"),
        &json!({ "cleaned_runners": cleaned }),
    );
    Ok(())
}
