//! `steroids merge` - integrate completed workstreams into mainline.

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde_json::json;
use steroids_core::merge::{MergeEngine, MergeOptions};
use steroids_core::{git, Error};

use crate::output;

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;

    let repo_id = ctx
        .project_root
        .canonicalize()
        .map_err(|e| Error::Io(format!("cannot canonicalize project root: {e}")))?
        .display()
        .to_string();

    let session = match matches.get_one::<String>("session") {
        Some(id) => ctx.global.get_session(id).await?,
        None => ctx
            .global
            .find_active_session(&repo_id)
            .await?
            .ok_or_else(|| anyhow!("no active parallel session for {repo_id}"))?,
    };

    // Default to completion order: completed lanes first, by their
    // completion timestamps.
    let workstream_ids: Vec<String> = match matches.get_one::<String>("workstreams") {
        Some(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        None => {
            let mut lanes = ctx.global.list_session_workstreams(&session.id).await?;
            lanes.sort_by_key(|ws| (ws.completion_order, ws.completed_at));
            lanes.into_iter().map(|ws| ws.id).collect()
        }
    };
    if workstream_ids.is_empty() {
        return Err(anyhow!("session {} has no workstreams to merge", session.id));
    }

    let runner = ctx
        .global
        .register_runner(
            &ctx.project_root.display().to_string(),
            std::process::id(),
        )
        .await?;

    let mut options = MergeOptions::new(session.id.clone(), runner.id, workstream_ids);
    if let Some(remote) = matches.get_one::<String>("remote") {
        options.remote.clone_from(remote);
    } else {
        options.remote.clone_from(&ctx.config.merge.remote);
    }
    if let Some(branch) = matches.get_one::<String>("main-branch") {
        options.main_branch.clone_from(branch);
    } else {
        options.main_branch.clone_from(&ctx.config.merge.main_branch);
    }
    if let Some(branch) = matches.get_one::<String>("integration-branch") {
        options.integration_branch = Some(branch.clone());
    }
    options.validation_command = ctx.config.merge.validation_command.clone();
    options.cleanup_workspaces =
        matches.get_flag("cleanup") || ctx.config.merge.cleanup_on_success;
    options.complete_session = !matches.get_flag("no-complete");
    options.lock_timeout =
        std::time::Duration::from_secs(ctx.config.merge.lock_timeout_mins * 60);
    options.heartbeat_interval =
        std::time::Duration::from_secs(ctx.config.merge.heartbeat_secs);

    let global_paths = &ctx.global_paths;
    let workspace_root = ctx.config.workspace_root_path(global_paths);
    let engine = MergeEngine::new(
        &ctx.global,
        git::system(),
        &ctx.registry,
        &ctx.config,
        ctx.project_root.clone(),
        workspace_root,
    );

    let outcome = engine.run(&options).await?;

    output::emit(
        json,
        &format!(
            "Merge {}: {} applied, {} conflict(s) resolved, {} skipped{}",
            if outcome.success { "succeeded" } else { "failed" },
            outcome.completed_commits,
            outcome.conflicts,
            outcome.skipped_commits,
            if outcome.errors.is_empty() {
                String::new()
            } else {
                format!("; errors: {}", outcome.errors.join(" "))
            }
        ),
        &json!({
            "success": outcome.success,
            "completed_commits": outcome.completed_commits,
            "conflicts": outcome.conflicts,
            "skipped_commits": outcome.skipped_commits,
            "errors": outcome.errors,
            "session_status": outcome.session_status.as_str(),
            "validation_escalation_id": outcome.validation_escalation_id,
        }),
    );

    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
