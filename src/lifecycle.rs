// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Command orchestration.
//!
//! One entry point per grove command, each consuming the lower layers
//! and returning a structured outcome for the CLI to print. All
//! external tools arrive through a [`Runner`], so every flow here is
//! testable against a scripted fake.
//!
//! Workspace creation is the delicate one. Resources are acquired in
//! a fixed order (directory, clone or mount, marker, hook, branch) and
//! a failure at any step releases what was already acquired in reverse
//! order before the error propagates: a failed hook destroys the
//! workspace, a failed clone removes the directory. The golden copy is
//! never touched by compensation.

use crate::backend::{Backend, BackendError};
use crate::clone::{exclude::ExcludeError, exclude::ExcludeSet, ClonePhase, ProgressEvent};
use crate::config::{self, BackendKind, Config, ConfigError};
use crate::hooks::{self, HookError};
use crate::image::{self, ImageError};
use crate::progress::{BandedCounter, Progress, CHECKOUT_START, CLONE_END, CLONE_START, HOOK_START};
use crate::runner::{Runner, RunnerError};
use crate::vcs::{GitCli, VcsError};
use crate::workspace::{self, Info, WorkspaceError};

use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Sink for user-facing status lines emitted mid-command.
pub type Notify<'a> = &'a mut dyn FnMut(&str);

/// A discovered project: root, configuration, and the expanded
/// workspace directory.
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
    pub workspace_dir: PathBuf,
}

impl Project {
    /// Walk up from `start` to the project root and load its
    /// configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NotInitialized`] outside any project.
    /// - Return [`ConfigError`] for unreadable configuration.
    pub fn discover(start: &Path) -> Result<Self> {
        let root = config::find_root(start)?;
        let config = config::load(&root)?;
        let project = config::project_name(&root);
        let workspace_dir = config::expand_workspace_dir(&config.workspace_dir, &project)?;
        Ok(Self {
            root,
            config,
            workspace_dir,
        })
    }

    fn backend(&self) -> Backend {
        Backend::for_kind(self.config.clone_backend)
    }
}

pub struct InitOptions {
    pub path: PathBuf,
    pub force: bool,
    pub warmup_command: Option<String>,
    pub workspace_dir: Option<String>,
    pub backend: BackendKind,
    pub image_size_gb: i64,
}

#[derive(Debug)]
pub struct InitOutcome {
    pub root: PathBuf,
    pub workspace_dir: PathBuf,
}

/// Register a git repository as a grove-managed golden copy.
///
/// Writes the default configuration (with any overrides), records the
/// chosen backend, and for the image backend builds the base image
/// right away. The warmup command runs before the base is synced so
/// freshly primed caches land inside it.
///
/// # Errors
///
/// - Return [`LifecycleError::NotARepo`] for a non-repository path.
/// - Return [`LifecycleError::AlreadyInitialized`] if `.grove/` exists.
/// - Return [`LifecycleError::Dirty`] for uncommitted changes without
///   `force`.
pub fn init(runner: &dyn Runner, opts: &InitOptions, notify: Notify<'_>) -> Result<InitOutcome> {
    let root = absolutize(&opts.path)?;

    let git = GitCli::new(runner);
    if !git.is_repo(&root) {
        return Err(LifecycleError::NotARepo(root));
    }
    if crate::store::grove_dir(&root).exists() {
        return Err(LifecycleError::AlreadyInitialized(root));
    }
    if git.is_dirty(&root).map_err(LifecycleError::StatusCheck)? && !opts.force {
        return Err(LifecycleError::Dirty {
            consequence: "workspace clones",
        });
    }

    make_dir(&crate::store::hooks_dir(&root))?;

    let mut cfg = Config::default();
    if let Some(warmup) = &opts.warmup_command {
        cfg.warmup_command = Some(warmup.clone());
    }
    if let Some(dir) = &opts.workspace_dir {
        cfg.workspace_dir = dir.clone();
    }
    cfg.clone_backend = opts.backend;
    config::save(&root, &cfg)?;

    if let Some(warmup) = &cfg.warmup_command {
        notify(&format!("Running warmup: {warmup}"));
        run_warmup(runner, &root, warmup)?;
    }

    if opts.backend == BackendKind::Image {
        notify("Initializing image backend...");
        image::base::init_base(
            &root,
            runner,
            opts.image_size_gb,
            cfg.exclude_patterns(),
            None,
        )?;
    }
    config::save_backend_state(&root, opts.backend)?;

    let project = config::project_name(&root);
    let workspace_dir = config::expand_workspace_dir(&cfg.workspace_dir, &project)?;
    Ok(InitOutcome {
        root,
        workspace_dir,
    })
}

#[derive(Default)]
pub struct CreateOptions {
    pub branch: Option<String>,
    pub force: bool,
}

/// Create a workspace from the golden copy.
///
/// # Errors
///
/// - Return [`LifecycleError::InsideWorkspace`] when run from one.
/// - Return [`LifecycleError::Dirty`] for uncommitted changes without
///   `force`.
/// - Return [`LifecycleError::LimitReached`] at the workspace cap.
/// - Return [`LifecycleError::HookFailed`] when the post-clone hook
///   fails; the workspace is destroyed first.
pub fn create(
    runner: &dyn Runner,
    start: &Path,
    opts: &CreateOptions,
    progress: &mut Progress<'_, '_>,
) -> Result<Info> {
    let created = create_inner(runner, start, opts, progress);
    if created.is_err() {
        progress.update(100, "failed");
    }
    created
}

fn create_inner(
    runner: &dyn Runner,
    start: &Path,
    opts: &CreateOptions,
    progress: &mut Progress<'_, '_>,
) -> Result<Info> {
    progress.update(0, "preflight");

    let project = Project::discover(start)?;
    if workspace::is_workspace(&project.root) {
        return Err(LifecycleError::InsideWorkspace {
            action: "create a workspace",
        });
    }
    config::ensure_backend_compatible(&project.root, &project.config)?;

    let git = GitCli::new(runner);
    if git
        .is_dirty(&project.root)
        .map_err(LifecycleError::StatusCheck)?
        && !opts.force
    {
        return Err(LifecycleError::Dirty {
            consequence: "the workspace clone",
        });
    }

    let branch = opts.branch.clone().unwrap_or_default();
    // Branchless workspaces still get a readable ID from whatever the
    // golden copy is on.
    let branch_for_id = if branch.is_empty() {
        git.current_branch(&project.root).unwrap_or_default()
    } else {
        branch.clone()
    };
    let commit = git.current_commit(&project.root).unwrap_or_default();

    let existing = workspace::list(&project.workspace_dir)?;
    if existing.len() >= project.config.max_workspaces {
        return Err(LifecycleError::LimitReached(project.config.max_workspaces));
    }

    let id = workspace::unique_id(&branch_for_id, &project.workspace_dir)?;
    let ws_path = project.workspace_dir.join(&id);
    make_dir(&project.workspace_dir)?;

    progress.update(CLONE_START, "clone");
    let excludes = ExcludeSet::new(project.config.exclude_patterns())?;
    let backend = project.backend();

    if progress.enabled() {
        let mut band = BandedCounter::new(CLONE_START, CLONE_END);
        let mut on_clone = |event: ProgressEvent| {
            if event.phase == ClonePhase::Clone {
                let pct = band.update(event.copied, event.total);
                progress.update(pct, "clone");
            }
        };
        backend.create_workspace(
            runner,
            &project.root,
            &id,
            &ws_path,
            &excludes,
            Some(&mut on_clone),
        )?;
    } else {
        backend.create_workspace(runner, &project.root, &id, &ws_path, &excludes, None)?;
    }

    let info = Info {
        id: id.clone(),
        golden_copy: project.root.clone(),
        golden_commit: commit,
        created_at: crate::time::now_utc(),
        branch: branch.clone(),
        path: ws_path.clone(),
    };
    if let Err(err) = workspace::write_marker(&info) {
        destroy_with_warning(backend, runner, &project.root, &id, &ws_path);
        return Err(err.into());
    }

    progress.update(HOOK_START, "post-clone hook");
    if let Err(err) = hooks::run(&ws_path, hooks::POST_CLONE, runner) {
        destroy_with_warning(backend, runner, &project.root, &id, &ws_path);
        return Err(LifecycleError::HookFailed(err));
    }

    if !branch.is_empty() {
        progress.update(CHECKOUT_START, "branch checkout");
        // The clone succeeded; a branch is secondary and must not
        // trigger cleanup.
        if let Err(err) = git.checkout(&ws_path, &branch, true) {
            warn!("branch checkout failed: {err}");
        }
    }
    progress.update(100, "done");
    Ok(info)
}

fn destroy_with_warning(backend: Backend, runner: &dyn Runner, root: &Path, id: &str, ws: &Path) {
    if let Err(err) = backend.destroy_workspace(runner, root, id, ws) {
        warn!("cleanup failed for {id}: {err}");
    }
}

/// All workspaces of the project containing `start`.
///
/// # Errors
///
/// - Return [`LifecycleError::Config`] outside any project.
pub fn list(start: &Path) -> Result<Vec<Info>> {
    let project = Project::discover(start)?;
    Ok(workspace::list(&project.workspace_dir)?)
}

/// Destroy one workspace by ID or absolute path, optionally pushing
/// its branch first.
///
/// # Errors
///
/// - Return [`LifecycleError::Workspace`] for an unknown target.
/// - Return [`LifecycleError::PushFailed`] when `push` is set and the
///   push fails; nothing is destroyed in that case.
pub fn destroy_one(
    runner: &dyn Runner,
    start: &Path,
    id_or_path: &str,
    push: bool,
) -> Result<String> {
    let project = Project::discover(start)?;
    let ws_path = workspace::resolve(&project.workspace_dir, id_or_path)?;
    let info = workspace::read_marker(&ws_path).ok().flatten();

    if push {
        if let Some(info) = &info {
            if !info.branch.is_empty() {
                GitCli::new(runner).push(&ws_path, &info.branch).map_err(|source| {
                    LifecycleError::PushFailed {
                        id: info.id.clone(),
                        branch: info.branch.clone(),
                        source,
                    }
                })?;
            }
        }
    }

    let id = info
        .map(|i| i.id)
        .or_else(|| {
            ws_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| id_or_path.to_string());
    project
        .backend()
        .destroy_workspace(runner, &project.root, &id, &ws_path)?;
    Ok(id_or_path.to_string())
}

#[derive(Debug)]
pub struct DestroyAllOutcome {
    /// Workspaces that existed when the sweep started.
    pub total: usize,
    /// IDs actually destroyed.
    pub destroyed: Vec<String>,
}

/// Destroy every workspace of the project. Individual failures are
/// warnings, not errors; the sweep continues.
///
/// # Errors
///
/// - Return [`LifecycleError::Config`] outside any project.
pub fn destroy_all(
    runner: &dyn Runner,
    start: &Path,
    push: bool,
    notify: Notify<'_>,
) -> Result<DestroyAllOutcome> {
    let project = Project::discover(start)?;
    let workspaces = workspace::list(&project.workspace_dir)?;
    let backend = project.backend();

    let mut outcome = DestroyAllOutcome {
        total: workspaces.len(),
        destroyed: Vec::new(),
    };
    for ws in workspaces {
        if push && !ws.branch.is_empty() {
            if let Err(err) = GitCli::new(runner).push(&ws.path, &ws.branch) {
                warn!("failed to push {} ({}): {err}", ws.id, ws.branch);
                continue;
            }
        }
        if let Err(err) = backend.destroy_workspace(runner, &project.root, &ws.id, &ws.path) {
            warn!("failed to destroy {}: {err}", ws.id);
            continue;
        }
        notify(&format!("Destroyed: {}", ws.id));
        outcome.destroyed.push(ws.id);
    }
    Ok(outcome)
}

#[derive(Debug)]
pub struct UpdateOutcome {
    pub commit: String,
    pub image_refreshed: bool,
}

/// Refresh the golden copy: pull, warmup, and for the image backend a
/// base re-sync.
///
/// # Errors
///
/// - Return [`LifecycleError::Pull`] if the pull fails.
/// - Return [`LifecycleError::Warmup`] if the warmup command fails.
/// - Return [`LifecycleError::Image`] if the base refresh fails, in
///   particular while image workspaces are still live.
pub fn update(runner: &dyn Runner, start: &Path, notify: Notify<'_>) -> Result<UpdateOutcome> {
    let project = Project::discover(start)?;
    config::ensure_backend_compatible(&project.root, &project.config)?;

    let git = GitCli::new(runner);
    notify("Pulling latest...");
    git.pull(&project.root).map_err(LifecycleError::Pull)?;

    if let Some(warmup) = &project.config.warmup_command {
        notify(&format!("Running warmup: {warmup}"));
        run_warmup(runner, &project.root, warmup)?;
    }

    let commit = git.current_commit(&project.root).unwrap_or_default();
    let backend = project.backend();
    if backend == Backend::Image {
        notify("Refreshing image backend...");
    }
    let refreshed = backend.refresh_base(
        runner,
        &project.root,
        &commit,
        project.config.exclude_patterns(),
    )?;

    Ok(UpdateOutcome {
        commit,
        image_refreshed: refreshed.is_some(),
    })
}

#[derive(Debug)]
pub struct MigrateOutcome {
    pub to: BackendKind,
    /// The project was already on the target backend.
    pub already: bool,
}

/// Switch the project between backends.
///
/// Same-backend migration is a repair: it re-persists configuration
/// and backend state and succeeds. Migrating to image builds the base
/// when none exists; migrating to tree is refused while image
/// workspaces are live.
///
/// # Errors
///
/// - Return [`LifecycleError::InsideWorkspace`] when run from one.
/// - Return [`LifecycleError::ActiveImageWorkspaces`] for tree
///   migration with live image workspaces.
pub fn migrate(
    runner: &dyn Runner,
    start: &Path,
    to: BackendKind,
    image_size_gb: i64,
    progress: &mut Progress<'_, '_>,
    notify: Notify<'_>,
) -> Result<MigrateOutcome> {
    let project = Project::discover(start)?;
    if workspace::is_workspace(&project.root) {
        return Err(LifecycleError::InsideWorkspace {
            action: "migrate the backend",
        });
    }
    let mut cfg = project.config;

    let current = match config::load_backend_state(&project.root)? {
        Some(backend) => backend,
        // Legacy projects without backend state: image state on disk
        // is the evidence.
        None => {
            if crate::store::image_state_path(&project.root).exists() {
                BackendKind::Image
            } else {
                BackendKind::Tree
            }
        }
    };

    if current == to {
        if cfg.clone_backend != to {
            cfg.clone_backend = to;
            config::save(&project.root, &cfg)?;
        }
        config::save_backend_state(&project.root, to)?;
        return Ok(MigrateOutcome { to, already: true });
    }

    match to {
        BackendKind::Image => {
            if image::load_state(&project.root)?.is_none() {
                if !progress.enabled() {
                    notify("Initializing image backend...");
                }
                let mut on_percent = |pct: u8| progress.update(pct, "sync");
                image::base::init_base(
                    &project.root,
                    runner,
                    image_size_gb,
                    cfg.exclude_patterns(),
                    Some(&mut on_percent),
                )?;
            }
        }
        BackendKind::Tree => {
            let live = image::list_workspaces(&project.root)?;
            if !live.is_empty() {
                return Err(LifecycleError::ActiveImageWorkspaces(live.len()));
            }
        }
    }

    cfg.clone_backend = to;
    config::save(&project.root, &cfg)?;
    config::save_backend_state(&project.root, to)?;
    Ok(MigrateOutcome { to, already: false })
}

#[derive(Debug)]
pub struct StatusReport {
    pub root: PathBuf,
    pub branch: String,
    pub commit: String,
    pub dirty: bool,
    pub inside_workspace: bool,
    pub workspaces: usize,
    pub max_workspaces: usize,
    pub workspace_dir: PathBuf,
}

/// Summarize the golden copy and its workspaces. Git queries are best
/// effort; a broken repository shows up as empty fields, not an error.
///
/// # Errors
///
/// - Return [`LifecycleError::Config`] outside any project.
pub fn status(runner: &dyn Runner, start: &Path) -> Result<StatusReport> {
    let project = Project::discover(start)?;
    let git = GitCli::new(runner);

    let branch = git.current_branch(&project.root).unwrap_or_default();
    let commit = git.current_commit(&project.root).unwrap_or_default();
    let dirty = git.is_dirty(&project.root).unwrap_or(false);
    let workspaces = workspace::list(&project.workspace_dir)?.len();

    Ok(StatusReport {
        inside_workspace: workspace::is_workspace(&project.root),
        branch,
        commit,
        dirty,
        workspaces,
        max_workspaces: project.config.max_workspaces,
        workspace_dir: project.workspace_dir,
        root: project.root,
    })
}

fn run_warmup(runner: &dyn Runner, root: &Path, command: &str) -> Result<()> {
    runner
        .interactive("sh", &["-c".to_string(), command.to_string()], Some(root))
        .map_err(LifecycleError::Warmup)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| LifecycleError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if path.as_os_str().is_empty() || path == Path::new(".") {
        Ok(cwd)
    } else {
        Ok(cwd.join(path))
    }
}

fn make_dir(path: &Path) -> Result<()> {
    mkdirp::mkdirp(path)
        .map(|_| ())
        .map_err(|source| LifecycleError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Lifecycle error types.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{} is not a git repository", .0.display())]
    NotARepo(PathBuf),

    #[error("grove already initialized at {}", .0.display())]
    AlreadyInitialized(PathBuf),

    #[error("cannot {action} from inside a workspace.\nRun this from the golden copy instead")]
    InsideWorkspace { action: &'static str },

    #[error(
        "golden copy has uncommitted changes.\nThese changes will be included in {consequence}.\nUse --force to proceed anyway"
    )]
    Dirty { consequence: &'static str },

    #[error("checking repository status failed")]
    StatusCheck(#[source] VcsError),

    #[error("max workspaces ({0}) reached - destroy one first")]
    LimitReached(usize),

    #[error("provide a workspace ID or path, or use --all")]
    MissingTarget,

    #[error("post-clone hook failed\nWorkspace cleaned up")]
    HookFailed(#[source] HookError),

    #[error("push failed for {id} ({branch})")]
    PushFailed {
        id: String,
        branch: String,
        #[source]
        source: VcsError,
    },

    #[error("git pull failed")]
    Pull(#[source] VcsError),

    #[error("warmup command failed")]
    Warmup(#[source] RunnerError),

    #[error("cannot migrate to tree with active image workspaces ({0}). Destroy them first")]
    ActiveImageWorkspaces(usize),

    #[error("lifecycle i/o failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Exclude(#[from] ExcludeError),
}

/// Friendly result alias :3
pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;
