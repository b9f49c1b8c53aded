// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! A directory is a grove project root iff it contains a `.grove/`
//! control directory. The configuration record inside it selects the
//! workspace directory, the workspace count limit, exclude patterns,
//! and the clone backend. A second record, `backend.json`, names the
//! backend that was actually *initialized*; the two must agree, and
//! the only legal way to change them is the migrate command.

use crate::store::{self, StoreError};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Workspace materialization strategy.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Direct copy-on-write clone of the project tree.
    #[default]
    Tree,

    /// Shared sparse disk image with per-workspace shadow overlays.
    Image,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tree => "tree",
            Self::Image => "image",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "tree" => Ok(Self::Tree),
            "image" => Ok(Self::Image),
            other => Err(ConfigError::InvalidBackend(other.into())),
        }
    }
}

/// Per-project configuration record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Shell command that primes build caches after a pull.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_command: Option<String>,

    /// Directory tree holding workspaces. The literal `{project}` is
    /// substituted with the project root's basename.
    pub workspace_dir: String,

    /// Upper bound on simultaneously existing workspaces.
    #[serde(default)]
    pub max_workspaces: usize,

    /// Glob patterns excluded from cloning and syncing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,

    /// Selected clone strategy.
    #[serde(default)]
    pub clone_backend: BackendKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            warmup_command: None,
            workspace_dir: "/tmp/grove/{project}".into(),
            max_workspaces: 10,
            exclude: None,
            clone_backend: BackendKind::Tree,
        }
    }
}

impl Config {
    /// Exclude patterns as a slice, empty when unset.
    pub fn exclude_patterns(&self) -> &[String] {
        self.exclude.as_deref().unwrap_or_default()
    }
}

/// Load and validate the configuration record of a project root.
///
/// A stored `max_workspaces` of zero is normalized to the default of
/// ten, matching what an omitted field deserializes to.
///
/// # Errors
///
/// - Return [`ConfigError::Missing`] if the record does not exist.
/// - Return [`ConfigError::InvalidExcludePattern`] if any exclude glob
///   fails to compile.
pub fn load(root: &Path) -> Result<Config> {
    let path = store::config_path(root);
    let mut config: Config = store::read_record(&path)?.ok_or(ConfigError::Missing(path))?;

    for pattern in config.exclude_patterns() {
        Pattern::new(pattern).map_err(|source| ConfigError::InvalidExcludePattern {
            pattern: pattern.clone(),
            source,
        })?;
    }
    if config.max_workspaces == 0 {
        config.max_workspaces = Config::default().max_workspaces;
    }

    Ok(config)
}

/// Persist the configuration record of a project root.
///
/// # Errors
///
/// - Return [`ConfigError::Store`] on write failure.
pub fn save(root: &Path, config: &Config) -> Result<()> {
    Ok(store::write_record(&store::config_path(root), config)?)
}

/// Expand `{project}` plus `~` and environment variables in a
/// workspace directory template.
///
/// # Errors
///
/// - Return [`ConfigError::Expand`] if an environment variable lookup
///   fails.
pub fn expand_workspace_dir(template: &str, project: &str) -> Result<PathBuf> {
    let substituted = template.replace("{project}", project);
    let expanded = shellexpand::full(&substituted).map_err(ConfigError::Expand)?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Project basename used for `{project}` substitution.
pub fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".into())
}

/// Resolve the project root by walking upward from `start` to the
/// first ancestor containing a `.grove/` directory.
///
/// # Errors
///
/// - Return [`ConfigError::NotInitialized`] if no ancestor qualifies.
pub fn find_root(start: &Path) -> Result<PathBuf> {
    let mut dir = if start.is_absolute() {
        start.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(start))
            .unwrap_or_else(|_| start.to_path_buf())
    };

    loop {
        if store::grove_dir(&dir).is_dir() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(ConfigError::NotInitialized(start.to_path_buf()));
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct BackendState {
    backend: BackendKind,
}

/// Read the initialized backend, `None` when never recorded.
///
/// # Errors
///
/// - Return [`ConfigError::Store`] on unreadable or invalid state.
pub fn load_backend_state(root: &Path) -> Result<Option<BackendKind>> {
    let state: Option<BackendState> = store::read_record(&store::backend_path(root))?;
    Ok(state.map(|s| s.backend))
}

/// Record the initialized backend.
///
/// # Errors
///
/// - Return [`ConfigError::Store`] on write failure.
pub fn save_backend_state(root: &Path, backend: BackendKind) -> Result<()> {
    Ok(store::write_record(
        &store::backend_path(root),
        &BackendState { backend },
    )?)
}

/// Verify the configured backend matches the initialized one.
///
/// Projects initialized before backend state existed have no
/// `backend.json`; those bootstrap from evidence: image state on disk
/// means the image backend was initialized, otherwise tree.
///
/// # Errors
///
/// - Return [`ConfigError::BackendMismatch`] when configuration and
///   initialized backend disagree; the message names the migrate
///   command that fixes it.
/// - Return [`ConfigError::ImageNotInitialized`] when the image
///   backend is configured but was never initialized.
pub fn ensure_backend_compatible(root: &Path, config: &Config) -> Result<()> {
    if let Some(initialized) = load_backend_state(root)? {
        if initialized != config.clone_backend {
            return Err(ConfigError::BackendMismatch {
                configured: config.clone_backend,
                initialized,
            });
        }
        return Ok(());
    }

    let has_image_state = store::image_state_path(root).exists();
    match config.clone_backend {
        BackendKind::Tree => {
            if has_image_state {
                return Err(ConfigError::BackendMismatch {
                    configured: BackendKind::Tree,
                    initialized: BackendKind::Image,
                });
            }
            save_backend_state(root, BackendKind::Tree)
        }
        BackendKind::Image => {
            if !has_image_state {
                return Err(ConfigError::ImageNotInitialized);
            }
            save_backend_state(root, BackendKind::Image)
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("grove not initialized: no .grove/ directory found above {}", .0.display())]
    NotInitialized(PathBuf),

    #[error("grove not initialized: missing {}", .0.display())]
    Missing(PathBuf),

    #[error("invalid clone_backend {0:?}: expected tree or image")]
    InvalidBackend(String),

    #[error("invalid exclude pattern {pattern:?}")]
    InvalidExcludePattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error(
        "configured clone_backend is \"{configured}\" but initialized backend is \"{initialized}\".\nRun `grove migrate --to {configured}`"
    )]
    BackendMismatch {
        configured: BackendKind,
        initialized: BackendKind,
    },

    #[error("image backend is not initialized.\nRun `grove migrate --to image`")]
    ImageNotInitialized,

    #[error("cannot expand workspace_dir")]
    Expand(#[source] shellexpand::LookupError<std::env::VarError>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
