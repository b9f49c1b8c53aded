// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

use grove::config::BackendKind;
use grove::lifecycle::{self, LifecycleError};
use grove::progress::{styled_bar, PhaseSink, PlainLines, Progress};
use grove::runner::ExecRunner;
use grove::workspace::Info;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{
    io::{self, IsTerminal},
    path::PathBuf,
    process::exit,
};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about = "Manage CoW-cloned workspaces with warm build caches",
    long_about = "Grove creates copy-on-write clones of a \"golden copy\" repository,\n\
                  preserving gitignored build state so every workspace starts with warm caches.",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(opts),
            Command::Create(opts) => run_create(opts),
            Command::List(opts) => run_list(opts),
            Command::Destroy(opts) => run_destroy(opts),
            Command::Update => run_update(),
            Command::Migrate(opts) => run_migrate(opts),
            Command::Status => run_status(),
            Command::Version => run_version(),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Initialize a golden copy from an existing repo.
    #[command(override_usage = "grove init [options] [path]")]
    Init(InitArgs),

    /// Create a new workspace from the golden copy.
    Create(CreateArgs),

    /// List active workspaces.
    List(ListArgs),

    /// Remove a workspace.
    #[command(override_usage = "grove destroy [options] <id|path>")]
    Destroy(DestroyArgs),

    /// Pull latest and rebuild the golden copy.
    Update,

    /// Migrate workspace backend safely.
    #[command(override_usage = "grove migrate --to <tree|image>")]
    Migrate(MigrateArgs),

    /// Show golden copy info and workspace summary.
    Status,

    /// Print the grove version.
    Version,
}

#[derive(Parser, Clone, Debug)]
struct InitArgs {
    #[arg(value_name = "path")]
    pub path: Option<PathBuf>,

    /// Command to run for warming up build caches.
    #[arg(long, value_name = "command")]
    pub warmup_command: Option<String>,

    /// Directory for workspaces (default: /tmp/grove/{project}).
    #[arg(long, value_name = "dir")]
    pub workspace_dir: Option<String>,

    /// Proceed even if golden copy has uncommitted changes.
    #[arg(long)]
    pub force: bool,

    /// Clone backend: tree or image.
    #[arg(long, value_name = "backend", default_value = "tree")]
    pub backend: BackendKind,

    /// Base image size in GB when initializing the image backend.
    #[arg(long, value_name = "gb", default_value_t = 200)]
    pub image_size_gb: i64,
}

#[derive(Parser, Clone, Debug)]
struct CreateArgs {
    /// Create and checkout a new git branch in the workspace
    /// (default: golden copy's current branch).
    #[arg(long, value_name = "name")]
    pub branch: Option<String>,

    /// Proceed even if golden copy has uncommitted changes.
    #[arg(long)]
    pub force: bool,

    /// Output workspace info as JSON.
    #[arg(long)]
    pub json: bool,

    /// Show progress output for long-running create operations.
    #[arg(long)]
    pub progress: bool,
}

#[derive(Parser, Clone, Debug)]
struct ListArgs {
    /// Output workspace list as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Clone, Debug)]
struct DestroyArgs {
    #[arg(value_name = "id|path")]
    pub target: Option<String>,

    /// Destroy all workspaces.
    #[arg(long)]
    pub all: bool,

    /// Push branch before destroying.
    #[arg(long)]
    pub push: bool,
}

#[derive(Parser, Clone, Debug)]
struct MigrateArgs {
    /// Target backend: tree or image.
    #[arg(long, value_name = "backend")]
    pub to: BackendKind,

    /// Base image size in GB when migrating to image.
    #[arg(long, value_name = "gb", default_value_t = 200)]
    pub image_size_gb: i64,

    /// Show progress output during image backend initialization.
    #[arg(long)]
    pub progress: bool,
}

fn main() {
    let layer = fmt::layer().compact().with_writer(io::stderr);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap();
    tracing_subscriber::registry().with(layer).with(filter).init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_init(args: InitArgs) -> Result<()> {
    let opts = lifecycle::InitOptions {
        path: args.path.unwrap_or_else(|| PathBuf::from(".")),
        force: args.force,
        warmup_command: args.warmup_command,
        workspace_dir: args.workspace_dir,
        backend: args.backend,
        image_size_gb: args.image_size_gb,
    };

    let mut notify = |line: &str| println!("{line}");
    let outcome = lifecycle::init(&ExecRunner, &opts, &mut notify)?;

    println!("Grove initialized at {}", outcome.root.display());
    println!("Workspace dir: {}", outcome.workspace_dir.display());
    Ok(())
}

fn run_create(args: CreateArgs) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let opts = lifecycle::CreateOptions {
        branch: args.branch,
        force: args.force,
    };

    let info = if args.progress {
        create_with_progress(&cwd, &opts)?
    } else {
        lifecycle::create(&ExecRunner, &cwd, &opts, &mut Progress::new(None))?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Workspace created: {}", info.id);
        println!("Path: {}", info.path.display());
        if !info.branch.is_empty() {
            println!("Branch: {}", info.branch);
        }
    }
    Ok(())
}

fn create_with_progress(cwd: &std::path::Path, opts: &lifecycle::CreateOptions) -> Result<Info> {
    let bar = io::stderr()
        .is_terminal()
        .then(|| styled_bar("create"))
        .transpose()?;
    let mut plain = PlainLines::new(io::stderr());

    let mut draw = |percent: u8, phase: &str| match &bar {
        Some(bar) => {
            bar.set_position(u64::from(percent));
            bar.set_message(phase.to_string());
        }
        None => plain.update(percent, phase),
    };
    let mut sink: PhaseSink<'_> = &mut draw;
    let mut progress = Progress::new(Some(&mut sink));

    let created = lifecycle::create(&ExecRunner, cwd, opts, &mut progress);
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    Ok(created?)
}

fn run_list(args: ListArgs) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let workspaces = lifecycle::list(&cwd)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&workspaces)?);
        return Ok(());
    }

    if workspaces.is_empty() {
        println!("No active workspaces.");
        return Ok(());
    }

    let id_width = column_width("ID", workspaces.iter().map(|ws| ws.id.len()));
    let branch_width = column_width("BRANCH", workspaces.iter().map(|ws| ws.branch.len()));
    let ages: Vec<String> = workspaces
        .iter()
        .map(|ws| format_age(&ws.created_at))
        .collect();
    let age_width = column_width("CREATED", ages.iter().map(String::len));

    println!("{:<id_width$}  {:<branch_width$}  {:<age_width$}  PATH", "ID", "BRANCH", "CREATED");
    for (ws, age) in workspaces.iter().zip(&ages) {
        println!(
            "{:<id_width$}  {:<branch_width$}  {:<age_width$}  {}",
            ws.id,
            ws.branch,
            age,
            ws.path.display()
        );
    }
    Ok(())
}

fn column_width(header: &str, widths: impl Iterator<Item = usize>) -> usize {
    widths.chain(std::iter::once(header.len())).max().unwrap_or(0)
}

fn format_age(created_at: &str) -> String {
    let Some(secs) = grove::time::age_seconds(created_at) else {
        return "unknown".into();
    };
    match secs {
        s if s < 60 => "just now".into(),
        s if s < 3_600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3_600),
        s => format!("{}d ago", s / 86_400),
    }
}

fn run_destroy(args: DestroyArgs) -> Result<()> {
    let cwd = std::env::current_dir()?;

    if args.all {
        let mut notify = |line: &str| println!("{line}");
        let outcome = lifecycle::destroy_all(&ExecRunner, &cwd, args.push, &mut notify)?;
        if outcome.total == 0 {
            println!("No workspaces to destroy.");
        }
        return Ok(());
    }

    let Some(target) = args.target else {
        return Err(LifecycleError::MissingTarget.into());
    };
    let destroyed = lifecycle::destroy_one(&ExecRunner, &cwd, &target, args.push)?;
    println!("Destroyed: {destroyed}");
    Ok(())
}

fn run_update() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let mut notify = |line: &str| println!("{line}");
    let outcome = lifecycle::update(&ExecRunner, &cwd, &mut notify)?;
    println!("Golden copy updated to {}", outcome.commit);
    Ok(())
}

fn run_migrate(args: MigrateArgs) -> Result<()> {
    let cwd = std::env::current_dir()?;

    let outcome = if args.progress {
        let bar = io::stderr()
            .is_terminal()
            .then(|| styled_bar("migrate"))
            .transpose()?;
        let mut plain = PlainLines::new(io::stderr());

        let mut draw = |percent: u8, phase: &str| match &bar {
            Some(bar) => {
                bar.set_position(u64::from(percent));
                bar.set_message(phase.to_string());
            }
            None => plain.update(percent, phase),
        };
        let mut sink: PhaseSink<'_> = &mut draw;
        let mut progress = Progress::new(Some(&mut sink));
        let mut notify = |line: &str| println!("{line}");

        let migrated = lifecycle::migrate(
            &ExecRunner,
            &cwd,
            args.to,
            args.image_size_gb,
            &mut progress,
            &mut notify,
        );
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        migrated?
    } else {
        let mut notify = |line: &str| println!("{line}");
        lifecycle::migrate(
            &ExecRunner,
            &cwd,
            args.to,
            args.image_size_gb,
            &mut Progress::new(None),
            &mut notify,
        )?
    };

    if outcome.already {
        println!("Backend already set to {}", outcome.to);
    } else {
        println!("Migrated backend to {}", outcome.to);
    }
    Ok(())
}

fn run_status() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let report = lifecycle::status(&ExecRunner, &cwd)?;

    if report.inside_workspace {
        println!("You are inside a grove workspace.");
        println!();
    }

    let status = if report.dirty {
        "dirty (uncommitted changes)"
    } else {
        "clean"
    };
    println!("Golden copy: {}", report.root.display());
    println!("Branch:      {}", report.branch);
    println!("Commit:      {}", report.commit);
    println!("Status:      {status}");
    println!();
    println!(
        "Workspaces:  {} / {} (max)",
        report.workspaces, report.max_workspaces
    );
    println!("Directory:   {}", report.workspace_dir.display());
    Ok(())
}

fn run_version() -> Result<()> {
    println!("grove {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
