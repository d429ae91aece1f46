//! `steroids sections` - sections and their dependency graph.

use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde_json::json;

use crate::output;

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    match matches.subcommand() {
        Some(("add", sub)) => add(sub, json).await,
        Some(("list", sub)) => list(sub, json).await,
        Some(("add-dep", sub)) => add_dep(sub, json).await,
        Some(("rm-dep", sub)) => rm_dep(sub, json).await,
        Some(("skip", sub)) => skip(sub, json).await,
        _ => Err(anyhow!("unknown sections subcommand")),
    }
}

async fn add(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let name = matches
        .get_one::<String>("name")
        .ok_or_else(|| anyhow!("name is required"))?;
    let position = match matches.get_one::<String>("position") {
        Some(value) => value.parse::<i64>()?,
        None => {
            // Default to after the current last section.
            ctx.store
                .list_sections()
                .await?
                .last()
                .map_or(0, |s| s.position + 10)
        }
    };
    let priority = matches
        .get_one::<String>("priority")
        .map_or(Ok(50), |v| v.parse::<i64>())?;

    let section = ctx.store.create_section(name, position, priority).await?;
    output::emit(
        json,
        &format!("Created section {} at position {}", section.name, section.position),
        &json!({
            "id": section.id,
            "name": section.name,
            "position": section.position,
            "priority": section.priority,
        }),
    );
    Ok(())
}

async fn list(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let sections = ctx.store.list_sections().await?;
    if json {
        let rows: Vec<_> = sections
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "name": s.name,
                    "position": s.position,
                    "priority": s.priority,
                    "skipped": s.skipped,
                })
            })
            .collect();
        output::emit(true, "", &json!(rows));
    } else {
        for section in &sections {
            println!(
                "{:>4}  {}{}  (priority {})",
                section.position,
                section.name,
                if section.skipped { " [skipped]" } else { "" },
                section.priority
            );
        }
    }
    Ok(())
}

async fn add_dep(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let section = resolve(matches, &ctx, "section").await?;
    let dep = resolve(matches, &ctx, "dep").await?;
    ctx.store.add_section_dependency(&section, &dep).await?;
    output::emit(
        json,
        &format!("{section} now depends on {dep}"),
        &json!({ "section": section, "depends_on": dep }),
    );
    Ok(())
}

async fn rm_dep(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let section = resolve(matches, &ctx, "section").await?;
    let dep = resolve(matches, &ctx, "dep").await?;
    let removed = ctx.store.remove_section_dependency(&section, &dep).await?;
    output::emit(
        json,
        &format!(
            "{}",
            if removed { "Dependency removed" } else { "No such dependency" }
        ),
        &json!({ "removed": removed }),
    );
    Ok(())
}

async fn skip(matches: &ArgMatches, json: bool) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;
    let section = resolve(matches, &ctx, "section").await?;
    let skipped = !matches.get_flag("unskip");
    ctx.store.set_section_skipped(&section, skipped).await?;
    output::emit(
        json,
        &format!(
            "Section {section} {}",
            if skipped { "skipped" } else { "unskipped" }
        ),
        &json!({ "section": section, "skipped": skipped }),
    );
    Ok(())
}

async fn resolve(
    matches: &ArgMatches,
    ctx: &super::CommandContext,
    arg: &str,
) -> Result<String> {
    let reference = matches
        .get_one::<String>(arg)
        .ok_or_else(|| anyhow!("{arg} is required"))?;
    Ok(ctx.store.resolve_section(reference).await?.id)
}
