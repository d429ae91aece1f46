//! `steroids tasks` - create, inspect, and transition tasks.

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde_json::json;
use steroids_core::store::NextTask;
use steroids_core::types::TaskStatus;

use crate::output;

/// Actor recorded for CLI-driven transitions.
const CLI_ACTOR: &str = "human";

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    match matches.subcommand() {
        Some(("add", sub)) => add(sub, json).await,
        Some(("list", sub)) => list(sub, json).await,
        Some(("show", sub)) => show(sub, json).await,
        Some(("update", sub)) => update(sub, json).await,
        Some(("next", sub)) => next(sub, json).await,
        _ => Err(anyhow!("unknown tasks subcommand")),
    }
}

fn task_json(task: &steroids_core::store::Task) -> serde_json::Value {
    json!({
        "id": task.id,
        "title": task.title,
        "status": task.status.as_str(),
        "section_id": task.section_id,
        "spec_path": task.spec_path,
        "rejection_count": task.rejection_count,
        "created_at": task.created_at.to_rfc3339(),
        "updated_at": task.updated_at.to_rfc3339(),
    })
}

async fn add(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let title = matches
        .get_one::<String>("title")
        .ok_or_else(|| anyhow!("title is required"))?;

    let section_id = match matches.get_one::<String>("section") {
        Some(reference) => Some(ctx.store.resolve_section(reference).await?.id),
        None => None,
    };
    let spec = matches.get_one::<String>("spec").map(String::as_str);

    let task = ctx
        .store
        .create_task(title, section_id.as_deref(), spec, CLI_ACTOR)
        .await?;
    output::emit(
        json,
        &format!("Created task {} ({})", task.id, task.title),
        &task_json(&task),
    );
    Ok(())
}

async fn list(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let status = matches
        .get_one::<String>("status")
        .map(|s| s.parse::<TaskStatus>())
        .transpose()?;

    let tasks = ctx.store.list_tasks(status, None).await?;
    if json {
        let rows: Vec<_> = tasks.iter().map(task_json).collect();
        output::emit(true, "", &json!(rows));
    } else {
        for task in &tasks {
            println!(
                "{}  {:<12} rej={:<3} {}",
                task.id,
                task.status.as_str(),
                task.rejection_count,
                task.title
            );
        }
        println!("{} task(s)", tasks.len());
    }
    Ok(())
}

async fn show(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let id = matches
        .get_one::<String>("id")
        .ok_or_else(|| anyhow!("task id is required"))?;

    let task = ctx.store.get_task(id).await?;
    let audit = ctx.store.audit_history(id).await?;
    let rejections = ctx.store.rejection_history(id).await?;

    if json {
        let audit_rows: Vec<_> = audit
            .iter()
            .map(|entry| {
                json!({
                    "from": entry.from_status,
                    "to": entry.to_status,
                    "actor": entry.actor,
                    "notes": entry.notes,
                    "commit": entry.commit_sha,
                    "at": entry.created_at.to_rfc3339(),
                })
            })
            .collect();
        output::emit(
            true,
            "",
            &json!({
                "task": task_json(&task),
                "audit": audit_rows,
                "rejections": rejections.len(),
            }),
        );
    } else {
        println!("{}: {} [{}]", task.id, task.title, task.status.as_str());
        println!("rejections: {}", task.rejection_count);
        for entry in &audit {
            println!(
                "  {} {} -> {} by {}{}",
                entry.created_at.to_rfc3339(),
                entry.from_status.as_deref().unwrap_or("-"),
                entry.to_status,
                entry.actor,
                entry
                    .notes
                    .as_deref()
                    .map(|n| format!(": {n}"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn update(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let id = matches
        .get_one::<String>("id")
        .ok_or_else(|| anyhow!("task id is required"))?;
    let status: TaskStatus = matches
        .get_one::<String>("status")
        .ok_or_else(|| anyhow!("--status is required"))?
        .parse()?;
    let notes = matches.get_one::<String>("notes").map(String::as_str);

    let task = ctx
        .store
        .transition_task(id, status, CLI_ACTOR, notes, None)
        .await?;
    output::emit(
        json,
        &format!("Task {} is now {}", task.id, task.status.as_str()),
        &task_json(&task),
    );
    Ok(())
}

async fn next(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let section = match matches.get_one::<String>("section") {
        Some(reference) => Some(ctx.store.resolve_section(reference).await?.id),
        None => None,
    };

    match ctx.store.next_task(section.as_deref()).await? {
        NextTask::Task(task) => {
            output::emit(
                json,
                &format!("Next: {} ({})", task.id, task.title),
                &task_json(&task),
            );
        }
        NextTask::Idle => {
            output::emit(json, "No eligible task", &json!({ "idle": true }));
        }
    }
    Ok(())
}
