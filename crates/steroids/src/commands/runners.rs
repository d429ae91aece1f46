//! `steroids runners` - start, stop, and list runner processes.

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde_json::json;
use steroids_core::provider::PauseResolution;
use steroids_core::scheduler::{PartitionStrategy, ProcessSpawner, Scheduler, Spawner};
use steroids_core::types::RunnerStatus;
use steroids_core::{git, Orchestrator};

use crate::output;

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    match matches.subcommand() {
        Some(("start", sub)) => start(sub, json).await,
        Some(("stop", sub)) => stop(sub, json).await,
        Some(("list", sub)) => list(sub, json).await,
        _ => Err(anyhow!("unknown runners subcommand")),
    }
}

async fn start(matches: &ArgMatches, json: bool) -> Result<()> {
    if matches.get_one::<String>("workstream-id").is_some() {
        return start_workstream_lane(matches, json).await;
    }
    if matches.get_flag("parallel") {
        return start_parallel(matches, json).await;
    }
    if matches.get_flag("detach") {
        // Re-spawn ourselves detached and return immediately.
        let project = super::project_root(matches)?;
        let spawner = ProcessSpawner::from_current_exe()?;
        let pid = spawner.spawn_project_runner(&project)?;
        output::emit(
            json,
            &format!("Started detached runner (pid {pid})"),
            &json!({ "pid": pid }),
        );
        return Ok(());
    }
    // Foreground runner: the continuous task loop.
    super::task_loop::run_with(matches, false, None, json).await
}

/// Launch a parallel session: partition, clone, lease, spawn.
async fn start_parallel(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;

    let strategy = match matches.get_one::<String>("strategy").map(String::as_str) {
        Some("components") => PartitionStrategy::Components,
        _ => PartitionStrategy::PerSection,
    };
    let max_clones = matches
        .get_one::<String>("max-clones")
        .and_then(|v| v.parse::<usize>().ok());

    let runner = ctx
        .global
        .register_runner(
            &ctx.project_root.display().to_string(),
            std::process::id(),
        )
        .await?;

    let spawner = ProcessSpawner::from_current_exe()?;
    let scheduler = Scheduler::new(
        ctx.project_root.clone(),
        &ctx.store,
        &ctx.global,
        git::system(),
        ctx.config.clone(),
        &spawner,
        runner.id.clone(),
    );

    let launch = scheduler.launch(strategy, max_clones).await?;

    let lanes: Vec<_> = launch
        .workstreams
        .iter()
        .map(|ws| {
            json!({
                "id": ws.id,
                "branch": ws.branch,
                "workspace": ws.workspace_path.display().to_string(),
                "pid": ws.pid,
            })
        })
        .collect();
    output::emit(
        json,
        &format!(
            "Launched session {} with {} workstream(s)",
            launch.session_id,
            launch.workstreams.len()
        ),
        &json!({ "session_id": launch.session_id, "workstreams": lanes }),
    );
    Ok(())
}

/// Run one workstream lane inside its clone: take over the lease, drive
/// the assigned sections to idle, then mark the lane completed.
async fn start_workstream_lane(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let workstream_id = matches
        .get_one::<String>("workstream-id")
        .ok_or_else(|| anyhow!("--workstream-id is required"))?;
    let section_ids: Vec<String> = matches
        .get_one::<String>("section-ids")
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    let runner = ctx
        .global
        .register_runner(
            &ctx.project_root.display().to_string(),
            std::process::id(),
        )
        .await?;
    ctx.global
        .set_runner_status(&runner.id, RunnerStatus::Running)
        .await?;

    // Take over the lease from the launching runner.
    let workstream = ctx.global.get_workstream(workstream_id).await?;
    let mut generation = ctx
        .global
        .claim_workstream(workstream_id, &runner.id, workstream.claim_generation)
        .await?;

    let orchestrator = Orchestrator::new(
        ctx.project_root.clone(),
        ctx.store.clone(),
        git::system(),
        ctx.registry.clone(),
        ctx.config.clone(),
    );

    // Drive each assigned section to idle, refreshing the lease between
    // phases.
    let mut failed = false;
    for section in &section_ids {
        loop {
            ctx.global
                .refresh_lease(workstream_id, &runner.id, generation)
                .await?;
            match orchestrator
                .run_loop(&ctx.global, &runner.id, true, Some(section.as_str()), |_| {
                    PauseResolution::Stopped
                })
                .await
            {
                Ok(summary) => {
                    if summary.paused.is_some() {
                        failed = true;
                        break;
                    }
                    if summary.phases == 0 {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, section = %section, "workstream lane failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            break;
        }
    }

    // Re-read the fence: the lease may have been taken over while a
    // provider invocation ran long.
    let current = ctx.global.get_workstream(workstream_id).await?;
    if current.runner_id.as_deref() == Some(runner.id.as_str()) {
        generation = current.claim_generation;
        let to = if failed {
            steroids_core::WorkstreamStatus::Failed
        } else {
            steroids_core::WorkstreamStatus::Completed
        };
        ctx.global
            .set_workstream_status(
                workstream_id,
                steroids_core::WorkstreamStatus::Running,
                generation,
                to,
            )
            .await?;
    }
    ctx.global
        .set_runner_status(&runner.id, RunnerStatus::Stopped)
        .await?;

    output::emit(
        json,
        &format!(
            "Workstream {workstream_id} {}",
            if failed { "failed" } else { "completed" }
        ),
        &json!({ "workstream_id": workstream_id, "failed": failed }),
    );
    Ok(())
}

async fn stop(matches: &ArgMatches, json: bool) -> Result<()> {
    let runner_id = matches
        .get_one::<String>("runner-id")
        .ok_or_else(|| anyhow!("runner id is required"))?;
    let global_paths = steroids_core::paths::GlobalPaths::resolve()?;
    let global = steroids_core::GlobalStore::open(&global_paths.db_path()).await?;
    global
        .set_runner_status(runner_id, RunnerStatus::Stopped)
        .await?;
    output::emit(
        json,
        &format!("Requested stop of runner {runner_id}"),
        &json!({ "runner_id": runner_id }),
    );
    Ok(())
}

async fn list(matches: &ArgMatches, json: bool) -> Result<()> {
    let project = super::project_root(matches)?;
    let global_paths = steroids_core::paths::GlobalPaths::resolve()?;
    let global = steroids_core::GlobalStore::open(&global_paths.db_path()).await?;
    let active = global
        .has_active_runner(&project.display().to_string())
        .await?;
    output::emit(
        json,
        &format!(
            "Project {} has {} runner",
            project.display(),
            if active { "an active" } else { "no active" }
        ),
        &json!({ "project": project.display().to_string(), "active_runner": active }),
    );
    Ok(())
}
