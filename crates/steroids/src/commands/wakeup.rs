//! `steroids wakeup` - scan registered projects for pending work.

use anyhow::Result;
use clap::ArgMatches;
use serde_json::json;
use steroids_core::paths::GlobalPaths;
use steroids_core::scheduler::ProcessSpawner;
use steroids_core::{run_wakeup, GlobalStore};

use crate::output;

pub async fn run(matches: &ArgMatches, json: bool) -> Result<()> {
    let dry_run = matches.get_flag("dry-run");
    let global_paths = GlobalPaths::resolve()?;
    let global = GlobalStore::open(&global_paths.db_path()).await?;
    let spawner = ProcessSpawner::from_current_exe()?;

    let report = run_wakeup(&global, &spawner, dry_run).await?;

    if json {
        let projects: Vec<_> = report
            .projects
            .iter()
            .map(|p| json!({ "project": p.project, "action": format!("{:?}", p.action) }))
            .collect();
        output::emit(
            true,
            "",
            &json!({
                "cleaned_runners": report.cleaned_runners,
                "started": report.started(),
                "projects": projects,
            }),
        );
    } else {
        for project in &report.projects {
            println!("{}: {:?}", project.project, project.action);
        }
        println!(
            "cleaned {} stale runner(s), started {} runner(s)",
            report.cleaned_runners,
            report.started()
        );
    }
    Ok(())
}
