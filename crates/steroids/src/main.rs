//! Steroids CLI - parallel execution engine for LLM-driven backlogs.
//!
//! Binary name: `steroids`

use anyhow::Result;
use clap::{Arg, ArgAction, Command as ClapCommand};

mod commands;
mod output;

use commands::{ai, cleanup, init, merge, runners, sections, task_loop, tasks, wakeup};

fn build_cli() -> ClapCommand {
    ClapCommand::new("steroids")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Steroids - drive a task backlog with coder/reviewer LLM runners")
        .subcommand_required(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit machine-readable JSON output"),
        )
        .subcommand(
            ClapCommand::new("init")
                .about("Initialize the task store for a project")
                .arg(project_arg()),
        )
        .subcommand(
            ClapCommand::new("loop")
                .about("Run the task loop until the backlog is idle")
                .arg(project_arg())
                .arg(
                    Arg::new("once")
                        .long("once")
                        .action(ArgAction::SetTrue)
                        .help("Run a single task to a terminal state, then exit"),
                )
                .arg(
                    Arg::new("section")
                        .long("section")
                        .value_name("ID|NAME")
                        .help("Only schedule tasks from this section"),
                ),
        )
        .subcommand(
            ClapCommand::new("runners")
                .about("Manage runner processes")
                .subcommand_required(true)
                .subcommand(
                    ClapCommand::new("start")
                        .about("Start a runner (foreground, parallel launch, or workstream lane)")
                        .arg(project_arg())
                        .arg(
                            Arg::new("detach")
                                .long("detach")
                                .action(ArgAction::SetTrue)
                                .help("Run detached from the terminal"),
                        )
                        .arg(
                            Arg::new("parallel")
                                .long("parallel")
                                .action(ArgAction::SetTrue)
                                .help("Partition sections into workstreams and launch clones"),
                        )
                        .arg(
                            Arg::new("strategy")
                                .long("strategy")
                                .value_name("per-section|components")
                                .help("Workstream partition strategy"),
                        )
                        .arg(
                            Arg::new("max-clones")
                                .long("max-clones")
                                .value_name("N")
                                .help("Override the maximum concurrent clones"),
                        )
                        .arg(
                            Arg::new("section-ids")
                                .long("section-ids")
                                .value_name("A,B,C")
                                .help("Sections assigned to this workstream lane"),
                        )
                        .arg(
                            Arg::new("branch")
                                .long("branch")
                                .value_name("BRANCH")
                                .help("Workstream branch"),
                        )
                        .arg(
                            Arg::new("parallel-session-id")
                                .long("parallel-session-id")
                                .value_name("ID")
                                .help("Parallel session this lane belongs to"),
                        )
                        .arg(
                            Arg::new("workstream-id")
                                .long("workstream-id")
                                .value_name("ID")
                                .help("Workstream lane to run"),
                        ),
                )
                .subcommand(
                    ClapCommand::new("stop")
                        .about("Request a cooperative stop of a runner")
                        .arg(
                            Arg::new("runner-id")
                                .required(true)
                                .help("Runner id to stop"),
                        ),
                )
                .subcommand(
                    ClapCommand::new("list")
                        .about("List runners")
                        .arg(project_arg()),
                ),
        )
        .subcommand(
            ClapCommand::new("merge")
                .about("Merge completed workstreams into mainline")
                .arg(project_arg())
                .arg(
                    Arg::new("session")
                        .long("session")
                        .value_name("ID")
                        .help("Parallel session to merge (defaults to the active session)"),
                )
                .arg(
                    Arg::new("workstreams")
                        .long("workstreams")
                        .value_name("A,B,C")
                        .help("Workstreams to merge, in order (defaults to completion order)"),
                )
                .arg(
                    Arg::new("remote")
                        .long("remote")
                        .value_name("REMOTE")
                        .help("Git remote (default origin)"),
                )
                .arg(
                    Arg::new("main-branch")
                        .long("main-branch")
                        .value_name("BRANCH")
                        .help("Mainline branch (default main)"),
                )
                .arg(
                    Arg::new("integration-branch")
                        .long("integration-branch")
                        .value_name("BRANCH")
                        .help("Integration branch name"),
                )
                .arg(
                    Arg::new("no-complete")
                        .long("no-complete")
                        .action(ArgAction::SetTrue)
                        .help("Leave the session running after merging (subset merge)"),
                )
                .arg(
                    Arg::new("cleanup")
                        .long("cleanup")
                        .action(ArgAction::SetTrue)
                        .help("Remove workstream workspaces after a successful merge"),
                ),
        )
        .subcommand(
            ClapCommand::new("tasks")
                .about("Manage tasks")
                .subcommand_required(true)
                .subcommand(
                    ClapCommand::new("add")
                        .about("Create a task")
                        .arg(project_arg())
                        .arg(Arg::new("title").required(true).help("Task title"))
                        .arg(
                            Arg::new("section")
                                .long("section")
                                .value_name("ID|NAME")
                                .help("Section to file the task under"),
                        )
                        .arg(
                            Arg::new("spec")
                                .long("spec")
                                .value_name("PATH")
                                .help("Path to the specification file"),
                        ),
                )
                .subcommand(
                    ClapCommand::new("list")
                        .about("List tasks")
                        .arg(project_arg())
                        .arg(
                            Arg::new("status")
                                .long("status")
                                .value_name("STATUS")
                                .help("Filter by status"),
                        ),
                )
                .subcommand(
                    ClapCommand::new("show")
                        .about("Show a task with its audit and rejection history")
                        .arg(project_arg())
                        .arg(Arg::new("id").required(true).help("Task id")),
                )
                .subcommand(
                    ClapCommand::new("update")
                        .about("Transition a task's status")
                        .arg(project_arg())
                        .arg(Arg::new("id").required(true).help("Task id"))
                        .arg(
                            Arg::new("status")
                                .long("status")
                                .required(true)
                                .value_name("STATUS")
                                .help("Target status"),
                        )
                        .arg(
                            Arg::new("notes")
                                .long("notes")
                                .value_name("TEXT")
                                .help("Notes for the audit entry"),
                        ),
                )
                .subcommand(
                    ClapCommand::new("next")
                        .about("Show the next eligible task")
                        .arg(project_arg())
                        .arg(
                            Arg::new("section")
                                .long("section")
                                .value_name("ID|NAME")
                                .help("Restrict to a section"),
                        ),
                ),
        )
        .subcommand(
            ClapCommand::new("sections")
                .about("Manage sections and their dependencies")
                .subcommand_required(true)
                .subcommand(
                    ClapCommand::new("add")
                        .about("Create a section")
                        .arg(project_arg())
                        .arg(Arg::new("name").required(true).help("Section name"))
                        .arg(
                            Arg::new("position")
                                .long("position")
                                .value_name("N")
                                .help("Ordinal position (defaults to last)"),
                        )
                        .arg(
                            Arg::new("priority")
                                .long("priority")
                                .value_name("0-100")
                                .help("Priority, 0 highest (default 50)"),
                        ),
                )
                .subcommand(
                    ClapCommand::new("list")
                        .about("List sections")
                        .arg(project_arg()),
                )
                .subcommand(
                    ClapCommand::new("add-dep")
                        .about("Add a dependency: SECTION depends on DEP")
                        .arg(project_arg())
                        .arg(Arg::new("section").required(true).help("Dependent section"))
                        .arg(Arg::new("dep").required(true).help("Section it depends on")),
                )
                .subcommand(
                    ClapCommand::new("rm-dep")
                        .about("Remove a dependency edge")
                        .arg(project_arg())
                        .arg(Arg::new("section").required(true).help("Dependent section"))
                        .arg(Arg::new("dep").required(true).help("Section it depends on")),
                )
                .subcommand(
                    ClapCommand::new("skip")
                        .about("Toggle a section's skipped flag")
                        .arg(project_arg())
                        .arg(Arg::new("section").required(true).help("Section"))
                        .arg(
                            Arg::new("unskip")
                                .long("unskip")
                                .action(ArgAction::SetTrue)
                                .help("Clear the skipped flag instead of setting it"),
                        ),
                ),
        )
        .subcommand(
            ClapCommand::new("ai")
                .about("Inspect provider adapters")
                .subcommand_required(true)
                .subcommand(ClapCommand::new("providers").about("List registered providers"))
                .subcommand(
                    ClapCommand::new("models")
                        .about("List models for a provider")
                        .arg(
                            Arg::new("provider")
                                .long("provider")
                                .value_name("NAME")
                                .help("Provider name (defaults to the configured default)"),
                        ),
                )
                .subcommand(
                    ClapCommand::new("test")
                        .about("Check which provider CLIs are available")
                        .arg(project_arg()),
                ),
        )
        .subcommand(
            ClapCommand::new("wakeup")
                .about("Scan registered projects and start runners for pending work")
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Report what would start without spawning anything"),
                ),
        )
        .subcommand(
            ClapCommand::new("cleanup")
                .about("Clean up stale runner records")
        )
}

fn project_arg() -> Arg {
    Arg::new("project")
        .long("project")
        .value_name("PATH")
        .help("Project directory (defaults to the current directory)")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level().into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(use_color())
        .init();

    let matches = build_cli().get_matches();
    let json = matches.get_flag("json") || std::env::var("STEROIDS_JSON").is_ok();

    let result = dispatch(&matches).await;
    match result {
        Ok(()) => {}
        Err(err) => {
            let code = output::report_error(&err, json);
            std::process::exit(code);
        }
    }
}

fn default_level() -> tracing::Level {
    if std::env::var("STEROIDS_VERBOSE").is_ok() {
        tracing::Level::DEBUG
    } else if std::env::var("STEROIDS_QUIET").is_ok() {
        tracing::Level::ERROR
    } else {
        tracing::Level::INFO
    }
}

fn use_color() -> bool {
    std::env::var("NO_COLOR").is_err()
        && std::env::var("STEROIDS_NO_COLOR").is_err()
        && std::env::var("CI").is_err()
}

async fn dispatch(matches: &clap::ArgMatches) -> Result<()> {
    let json = matches.get_flag("json") || std::env::var("STEROIDS_JSON").is_ok();
    match matches.subcommand() {
        Some(("init", sub)) => init::run(sub, json).await,
        Some(("loop", sub)) => task_loop::run(sub, json).await,
        Some(("runners", sub)) => runners::run(sub, json).await,
        Some(("merge", sub)) => merge::run(sub, json).await,
        Some(("tasks", sub)) => tasks::run(sub, json).await,
        Some(("sections", sub)) => sections::run(sub, json).await,
        Some(("ai", sub)) => ai::run(sub, json).await,
        Some(("wakeup", sub)) => wakeup::run(sub, json).await,
        Some(("cleanup", sub)) => cleanup::run(sub, json).await,
        _ => {
            build_cli().print_help()?;
            Ok(())
        }
    }
}
