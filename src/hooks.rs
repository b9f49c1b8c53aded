// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! User hook execution.
//!
//! Hooks are plain executables under `.grove/hooks/` of the directory
//! they run in; for the post-clone hook that is the freshly cloned
//! workspace, so the hook sees and primes the workspace itself. A
//! missing hook is not an event. A present but non-executable one is
//! an error, because silently skipping an intended hook is worse than
//! failing loudly.

use crate::runner::{Runner, RunnerError};

use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Name of the hook run after a workspace clone.
pub const POST_CLONE: &str = "post-clone";

/// Run hook `name` from `root`'s hook directory with its working
/// directory set to `root` and stdio inherited. Returns whether a hook
/// actually ran.
///
/// # Errors
///
/// - Return [`HookError::NotExecutable`] if the hook exists without an
///   executable bit.
/// - Return [`HookError::Failed`] if the hook exits non-zero.
pub fn run(root: &Path, name: &str, runner: &dyn Runner) -> Result<bool> {
    let hook_path = crate::store::hooks_dir(root).join(name);

    let meta = match std::fs::metadata(&hook_path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("no {name} hook at {}", hook_path.display());
            return Ok(false);
        }
        Err(source) => {
            return Err(HookError::Io {
                path: hook_path,
                source,
            })
        }
    };

    if meta.permissions().mode() & 0o111 == 0 {
        return Err(HookError::NotExecutable { path: hook_path });
    }

    runner
        .interactive(&hook_path.display().to_string(), &[], Some(root))
        .map_err(|source| HookError::Failed {
            name: name.to_string(),
            source,
        })?;
    Ok(true)
}

/// Hook error types.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook exists but is not executable: chmod +x {}", path.display())]
    NotExecutable { path: PathBuf },

    #[error("hook {name} failed")]
    Failed {
        name: String,
        #[source]
        source: RunnerError,
    },

    #[error("cannot stat hook at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = HookError> = std::result::Result<T, E>;
