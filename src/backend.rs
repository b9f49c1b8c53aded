// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Backend selection.
//!
//! Both clone strategies present the same three operations to the
//! lifecycle: create a workspace at a path, destroy one, refresh the
//! shared base. The tree backend clones the project directly and has
//! no base to refresh; the image backend mounts the shared image with
//! a fresh shadow.
//!
//! Destruction is routed by evidence, not by the configured backend:
//! a workspace with image metadata is detached through the image
//! path even if the configuration has since migrated to tree, so a
//! half-finished migration can never leak an attached device.

use crate::clone::{
    self,
    exclude::{selective_clone, selective_clone_with_progress, ExcludeSet},
    CloneProgress,
};
use crate::config::BackendKind;
use crate::image::{self, ImageState};
use crate::runner::Runner;

use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::warn;

/// A clone strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Tree,
    Image,
}

impl Backend {
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Tree => Self::Tree,
            BackendKind::Image => Self::Image,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tree => "tree",
            Self::Image => "image",
        }
    }

    /// Materialize the workspace `id` at `ws_path`.
    ///
    /// Tree: a copy-on-write clone of `root` honoring `excludes`.
    /// Image: the base image attached with a fresh shadow overlay. A
    /// failed clone leaves no directory behind.
    ///
    /// # Errors
    ///
    /// - Return [`BackendError::Clone`] or [`BackendError::Image`] from
    ///   the underlying strategy.
    pub fn create_workspace(
        self,
        runner: &dyn Runner,
        root: &Path,
        id: &str,
        ws_path: &Path,
        excludes: &ExcludeSet,
        on_clone: Option<CloneProgress<'_>>,
    ) -> Result<()> {
        match self {
            Self::Tree => {
                let cloner = clone::detect(root, runner)?;
                let cloned = match on_clone {
                    Some(on_clone) => {
                        selective_clone_with_progress(&cloner, root, ws_path, excludes, on_clone)
                    }
                    None => selective_clone(&cloner, root, ws_path, excludes),
                };
                if let Err(err) = cloned {
                    if let Err(rm_err) = remove_tree(ws_path) {
                        warn!("cleanup of partial clone failed: {rm_err}");
                    }
                    return Err(err.into());
                }
                Ok(())
            }
            Self::Image => {
                image::base::create_workspace(root, runner, id, ws_path)?;
                if let Some(on_clone) = on_clone {
                    // The attach is a single quick step; report it as a
                    // completed clone so the bar lands at the band end.
                    on_clone(clone::ProgressEvent {
                        phase: clone::ClonePhase::Clone,
                        copied: 1,
                        total: 1,
                    });
                }
                Ok(())
            }
        }
    }

    /// Tear the workspace `id` at `ws_path` down.
    ///
    /// # Errors
    ///
    /// - Return [`BackendError::Image`] if detach-based teardown fails.
    /// - Return [`BackendError::Io`] if directory removal fails.
    pub fn destroy_workspace(
        self,
        runner: &dyn Runner,
        root: &Path,
        id: &str,
        ws_path: &Path,
    ) -> Result<()> {
        if image::load_workspace(root, id)?.is_some() {
            return Ok(image::base::destroy_workspace(root, runner, id)?);
        }
        remove_tree(ws_path).map_err(|source| BackendError::Io {
            path: ws_path.to_path_buf(),
            source,
        })
    }

    /// Refresh the shared base after a golden copy update. The tree
    /// backend has no base; `None` means nothing was refreshed.
    ///
    /// # Errors
    ///
    /// - Return [`BackendError::Image`] if the image refresh fails.
    pub fn refresh_base(
        self,
        runner: &dyn Runner,
        root: &Path,
        commit: &str,
        excludes: &[String],
    ) -> Result<Option<ImageState>> {
        match self {
            Self::Tree => Ok(None),
            Self::Image => Ok(Some(image::base::refresh_base(
                root, runner, commit, excludes,
            )?)),
        }
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Backend error types.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Clone(#[from] clone::CloneError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("cannot remove workspace at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = BackendError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{FakeRunner, Script};
    use crate::store;
    use pretty_assertions::assert_eq;

    fn no_excludes() -> ExcludeSet {
        ExcludeSet::new(&[]).expect("empty set compiles")
    }

    #[test]
    fn names_match_the_configured_kinds() {
        assert_eq!(Backend::for_kind(BackendKind::Tree).name(), "tree");
        assert_eq!(Backend::for_kind(BackendKind::Image).name(), "image");
    }

    #[test]
    fn tree_create_cleans_up_a_failed_clone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("proj");
        std::fs::create_dir_all(&root)?;
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws)?; // partial clone debris

        let runner = FakeRunner::new();
        runner.push(Script::with_output("btrfs\n")); // stat detection
        runner.push(Script::fail("cp: read error"));

        let err = Backend::Tree
            .create_workspace(&runner, &root, "fix-9a2b", &ws, &no_excludes(), None)
            .unwrap_err();
        assert!(matches!(err, BackendError::Clone(_)));
        assert!(!ws.exists());
        Ok(())
    }

    #[test]
    fn destroy_routes_through_image_metadata_when_present() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws)?;
        image::save_workspace(
            dir.path(),
            &image::ImageWorkspace {
                id: "fix-9a2b".into(),
                mountpoint: ws.clone(),
                device: "/dev/disk6s1".into(),
                shadow_path: store::shadow_path(dir.path(), "fix-9a2b"),
                base_generation: 1,
                created_at: crate::time::now_utc(),
            },
        )?;

        let runner = FakeRunner::new();
        runner.push(Script::ok()); // hdiutil detach

        // Even the tree backend must not rip out a mounted image.
        Backend::Tree.destroy_workspace(&runner, dir.path(), "fix-9a2b", &ws)?;

        assert_eq!(runner.calls.borrow()[0].0, "hdiutil");
        assert!(image::load_workspace(dir.path(), "fix-9a2b")?.is_none());
        Ok(())
    }

    #[test]
    fn destroy_without_metadata_removes_the_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(ws.join("sub"))?;

        let runner = FakeRunner::new();
        Backend::Tree.destroy_workspace(&runner, dir.path(), "fix-9a2b", &ws)?;

        assert!(!ws.exists());
        assert!(runner.calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn tree_backend_refresh_is_a_no_op() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = FakeRunner::new();

        let refreshed = Backend::Tree.refresh_base(&runner, dir.path(), "abc1234", &[])?;
        assert_eq!(refreshed, None);
        assert!(runner.calls.borrow().is_empty());
        Ok(())
    }
}
