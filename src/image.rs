// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Image backend records.
//!
//! The image backend keeps one shared sparse disk image per project
//! plus a shadow overlay per workspace. Two record kinds track it:
//!
//! - [`ImageState`], one per project, under `.grove/images/state.json`:
//!   where the base image lives and its generation counter, bumped on
//!   every re-sync from the project root;
//! - [`ImageWorkspace`], one per workspace, under
//!   `.grove/workspaces/<id>.json`: the attached device, mountpoint,
//!   shadow file, and the base generation the workspace was born from.
//!
//! The presence of a workspace record is what makes destruction
//! route through detach; losing one would leak an attached device, so
//! records are written before the workspace is reported created and
//! deleted only after its device is gone.

pub mod base;
pub mod commands;

use crate::runner::RunnerError;
use crate::store::{self, StoreError};

use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};

/// Per-project image backend state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageState {
    pub backend: String,
    pub base_path: PathBuf,
    pub base_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_commit: Option<String>,
}

/// Per-workspace image metadata.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageWorkspace {
    pub id: String,
    pub mountpoint: PathBuf,
    pub device: String,
    pub shadow_path: PathBuf,
    pub base_generation: u64,
    pub created_at: String,
}

/// Read the project's image state, `None` when the image backend was
/// never initialized.
///
/// # Errors
///
/// - Return [`ImageError::Store`] on unreadable or invalid state.
pub fn load_state(root: &Path) -> Result<Option<ImageState>> {
    Ok(store::read_record(&store::image_state_path(root))?)
}

/// Persist the project's image state.
///
/// # Errors
///
/// - Return [`ImageError::Store`] on write failure.
pub fn save_state(root: &Path, state: &ImageState) -> Result<()> {
    Ok(store::write_record(&store::image_state_path(root), state)?)
}

/// Read one workspace's image metadata.
///
/// # Errors
///
/// - Return [`ImageError::Store`] on unreadable or invalid metadata.
pub fn load_workspace(root: &Path, id: &str) -> Result<Option<ImageWorkspace>> {
    Ok(store::read_record(&store::image_workspace_path(root, id))?)
}

/// Persist one workspace's image metadata.
///
/// # Errors
///
/// - Return [`ImageError::Store`] on write failure.
pub fn save_workspace(root: &Path, meta: &ImageWorkspace) -> Result<()> {
    Ok(store::write_record(
        &store::image_workspace_path(root, &meta.id),
        meta,
    )?)
}

/// Delete one workspace's image metadata; absence is fine.
///
/// # Errors
///
/// - Return [`ImageError::Store`] on removal failure.
pub fn delete_workspace(root: &Path, id: &str) -> Result<()> {
    Ok(store::remove_record(&store::image_workspace_path(root, id))?)
}

/// All image workspace records of a project, sorted by id. A missing
/// records directory means no workspaces.
///
/// # Errors
///
/// - Return [`ImageError::Io`] if the directory cannot be listed.
/// - Return [`ImageError::Store`] if a record is unreadable.
pub fn list_workspaces(root: &Path) -> Result<Vec<ImageWorkspace>> {
    let dir = store::image_workspaces_dir(root);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(ImageError::Io { path: dir, source }),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ImageError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(meta) = store::read_record::<ImageWorkspace>(&path)? {
            out.push(meta);
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

/// Image backend error types.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image backend state missing; run `grove migrate --to image` first")]
    StateMissing,

    #[error("no image workspace metadata for {0:?}")]
    MetaMissing(String),

    #[error("cannot refresh base with active image workspaces ({0})")]
    ActiveWorkspaces(usize),

    #[error("image i/o failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{tool} {op} failed")]
    Command {
        tool: &'static str,
        op: &'static str,
        #[source]
        source: RunnerError,
    },

    #[error("cannot parse attach output: missing dev-entry or mount-point:\n{output}")]
    ParseAttach { output: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = ImageError> = std::result::Result<T, E>;
