//! `steroids loop` - run the orchestrator until idle.

use anyhow::Result;
use clap::ArgMatches;
use serde_json::json;
use steroids_core::provider::PauseResolution;
use steroids_core::{git, Orchestrator};

use crate::output;

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    let once = matches.get_flag("once");
    let section = matches.get_one::<String>("section").cloned();
    run_with(matches, once, section, json).await
}

/// Shared loop entry for `loop` and foreground `runners start`.
pub async fn run_with(
    matches: &ArgMatches,
    once: bool,
    section: Option<String>,
    json: bool,
) -> Result<()> {
    let ctx = super::CommandContext::open(matches).await?;

    let section = match section {
        Some(reference) => Some(ctx.store.resolve_section(&reference).await?.id),
        None => None,
    };

    let runner = ctx
        .global
        .register_runner(
            &ctx.project_root.display().to_string(),
            std::process::id(),
        )
        .await?;
    ctx.global
        .set_runner_status(&runner.id, steroids_core::types::RunnerStatus::Running)
        .await?;

    let orchestrator = Orchestrator::new(
        ctx.project_root.clone(),
        ctx.store.clone(),
        git::system(),
        ctx.registry.clone(),
        ctx.config.clone(),
    );

    let summary = orchestrator
        .run_loop(&ctx.global, &runner.id, once, section.as_deref(), |alert| {
            // Non-interactive host: a credit-exhaustion pause stops the
            // loop so the operator can reconfigure.
            tracing::error!(
                provider = %alert.provider,
                role = alert.role.as_str(),
                message = %alert.message,
                "provider credits exhausted; stopping loop"
            );
            PauseResolution::Stopped
        })
        .await;

    ctx.global
        .set_runner_status(&runner.id, steroids_core::types::RunnerStatus::Stopped)
        .await?;
    let summary = summary?;

    output::emit(
        json,
        &format!(
            "Loop finished: {} phase(s), {} completed, {} failed",
            summary.phases, summary.completed, summary.failed
        ),
        &json!({
            "phases": summary.phases,
            "completed": summary.completed,
            "failed": summary.failed,
            "paused": summary.paused.as_ref().map(|a| a.provider.clone()),
        }),
    );

    if summary.pause_resolution == Some(PauseResolution::ImmediateFail) {
        std::process::exit(1);
    }
    Ok(())
}
