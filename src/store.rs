// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Persistent state store.
//!
//! All grove state lives as JSON records under the project root's
//! `.grove/` control directory:
//!
//! ```text
//! .grove/
//!   config.json              configuration record
//!   backend.json             initialized backend selection
//!   hooks/                   user scripts
//!   images/
//!     base.sparsebundle      base image (image backend)
//!     state.json             image backend state
//!   workspaces/<id>.json     per-image-workspace metadata
//!   shadows/<id>.shadow      per-image-workspace overlay
//!   mnt/base                 mountpoint for base refresh
//! ```
//!
//! Every workspace additionally carries its own
//! `.grove/workspace.json` marker.
//!
//! Records are written whole with a write-then-rename in the target
//! directory, so a crashed writer leaves either the old record or none
//! at all. Readers treat a missing file as "record absent" and only
//! fail on unreadable or unparseable content.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

pub const GROVE_DIR: &str = ".grove";
pub const CONFIG_FILE: &str = "config.json";
pub const BACKEND_FILE: &str = "backend.json";
pub const WORKSPACE_FILE: &str = "workspace.json";
pub const HOOKS_DIR: &str = "hooks";

/// Control directory for a project or workspace root.
pub fn grove_dir(root: &Path) -> PathBuf {
    root.join(GROVE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    grove_dir(root).join(CONFIG_FILE)
}

pub fn backend_path(root: &Path) -> PathBuf {
    grove_dir(root).join(BACKEND_FILE)
}

pub fn hooks_dir(root: &Path) -> PathBuf {
    grove_dir(root).join(HOOKS_DIR)
}

pub fn marker_path(workspace: &Path) -> PathBuf {
    grove_dir(workspace).join(WORKSPACE_FILE)
}

pub fn images_dir(root: &Path) -> PathBuf {
    grove_dir(root).join("images")
}

pub fn image_state_path(root: &Path) -> PathBuf {
    images_dir(root).join("state.json")
}

pub fn base_bundle_path(root: &Path) -> PathBuf {
    images_dir(root).join("base.sparsebundle")
}

pub fn image_workspaces_dir(root: &Path) -> PathBuf {
    grove_dir(root).join("workspaces")
}

pub fn image_workspace_path(root: &Path, id: &str) -> PathBuf {
    image_workspaces_dir(root).join(format!("{id}.json"))
}

pub fn shadows_dir(root: &Path) -> PathBuf {
    grove_dir(root).join("shadows")
}

pub fn shadow_path(root: &Path, id: &str) -> PathBuf {
    shadows_dir(root).join(format!("{id}.shadow"))
}

pub fn base_mountpoint(root: &Path) -> PathBuf {
    grove_dir(root).join("mnt").join("base")
}

/// Write a record as two-space-indented JSON, atomically enough to
/// survive a crash: parents are created first, content goes to a
/// sibling temp file, then a rename swaps it into place.
///
/// # Errors
///
/// - Return [`StoreError::Io`] on any filesystem failure.
/// - Return [`StoreError::Serialize`] if the record cannot be encoded.
pub fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        mkdirp::mkdirp(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let data = serde_json::to_string_pretty(record).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = temp_sibling(path);
    fs::write(&tmp, data).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a record, distinguishing absence from breakage.
///
/// # Errors
///
/// - Return [`StoreError::Io`] on read failures other than not-found.
/// - Return [`StoreError::Parse`] if the file exists but is not a
///   valid record of type `T`.
pub fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let record = serde_json::from_str(&data).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(record))
}

/// Remove a record, treating absence as success.
///
/// # Errors
///
/// - Return [`StoreError::Io`] on any other filesystem failure.
pub fn remove_record(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".into());
    path.with_file_name(format!(".{name}.tmp"))
}

/// State store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store i/o failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid record at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode record for {}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
