// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Filesystem copy-on-write clone primitive.
//!
//! A workspace is only cheap if its files share blocks with the golden
//! copy, so the cloner insists on real CoW support and refuses to run
//! anywhere it would silently degrade to a deep copy:
//!
//! - the host filesystem must support block-level sharing (APFS on
//!   macOS, btrfs or xfs with reflink on Linux), otherwise
//!   [`CloneError::UnsupportedFilesystem`];
//! - source and destination must sit on the same volume, verified by
//!   comparing device identifiers before anything is copied, otherwise
//!   [`CloneError::CrossDevice`].
//!
//! The actual clone is delegated to the platform `cp` through the
//! command runner. The progress variant runs `cp -v` and counts the
//! per-entry lines it prints against a pre-scanned entry total.

pub mod exclude;

use crate::runner::{Runner, RunnerError};

use std::{
    fs, io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Phase of a clone operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonePhase {
    /// Counting entries before any copying starts.
    Scan,
    /// Copying entries; `copied` grows toward `total`.
    Clone,
}

/// One progress observation. `copied <= total` and `copied` is
/// non-decreasing over the life of an operation.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub phase: ClonePhase,
    pub copied: usize,
    pub total: usize,
}

/// Progress callback for clone operations.
pub type CloneProgress<'a> = &'a mut (dyn FnMut(ProgressEvent) + Send);

/// Performs copy-on-write directory clones.
pub trait Cloner {
    /// Clone `src` to `dst` (which must not exist yet).
    ///
    /// # Errors
    ///
    /// - Return [`CloneError::CrossDevice`] if preflight fails.
    /// - Return [`CloneError::CloneFailed`] if the clone tool fails.
    fn clone_tree(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Clone with progress events: one `Scan` event carrying the total,
    /// then `Clone` events as entries land.
    ///
    /// # Errors
    ///
    /// Same contract as [`Cloner::clone_tree`].
    fn clone_tree_with_progress(
        &self,
        src: &Path,
        dst: &Path,
        on_progress: CloneProgress<'_>,
    ) -> Result<()>;
}

/// CoW cloner delegating to the platform `cp`.
pub struct CpCloner<'r> {
    runner: &'r dyn Runner,
    flags: &'static [&'static str],
}

impl std::fmt::Debug for CpCloner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpCloner")
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Cloner for CpCloner<'_> {
    fn clone_tree(&self, src: &Path, dst: &Path) -> Result<()> {
        ensure_same_filesystem(src, dst)?;
        let args = self.args(src, dst, false);
        self.runner
            .output("cp", &args)
            .map_err(|source| CloneError::CloneFailed { source })?;
        Ok(())
    }

    fn clone_tree_with_progress(
        &self,
        src: &Path,
        dst: &Path,
        on_progress: CloneProgress<'_>,
    ) -> Result<()> {
        ensure_same_filesystem(src, dst)?;
        let total = count_entries(src).unwrap_or(0);
        on_progress(ProgressEvent {
            phase: ClonePhase::Scan,
            copied: 0,
            total,
        });

        let args = self.args(src, dst, true);
        let mut copied = 0usize;
        self.runner
            .stream("cp", &args, &mut |line| {
                if !is_cp_verbose_entry(line) {
                    return;
                }
                copied += 1;
                on_progress(ProgressEvent {
                    phase: ClonePhase::Clone,
                    copied,
                    total,
                });
            })
            .map_err(|source| CloneError::CloneFailed { source })?;
        Ok(())
    }
}

impl CpCloner<'_> {
    fn args(&self, src: &Path, dst: &Path, verbose: bool) -> Vec<String> {
        let mut args: Vec<String> = self.flags.iter().map(|f| f.to_string()).collect();
        if verbose {
            args.push("-v".into());
        }
        args.push(src.display().to_string());
        args.push(dst.display().to_string());
        args
    }
}

/// Pick the CoW cloner for the current platform, verifying filesystem
/// support at `path` first.
///
/// # Errors
///
/// - Return [`CloneError::UnsupportedFilesystem`] when the filesystem
///   cannot share blocks.
/// - Return [`CloneError::UnsupportedPlatform`] on platforms without a
///   known CoW clone tool.
pub fn detect<'r>(path: &Path, runner: &'r dyn Runner) -> Result<CpCloner<'r>> {
    cloner_for_os(std::env::consts::OS, path, runner)
}

pub(crate) fn cloner_for_os<'r>(
    os: &str,
    path: &Path,
    runner: &'r dyn Runner,
) -> Result<CpCloner<'r>> {
    match os {
        "macos" => {
            let fstype = darwin_fstype(path, runner)?;
            if !fstype.contains("APFS") {
                return Err(CloneError::UnsupportedFilesystem {
                    path: path.to_path_buf(),
                    fstype,
                });
            }
            Ok(CpCloner {
                runner,
                flags: &["-c", "-R"],
            })
        }
        "linux" => {
            let fstype = linux_fstype(path, runner)?;
            if !matches!(fstype.as_str(), "btrfs" | "xfs") {
                return Err(CloneError::UnsupportedFilesystem {
                    path: path.to_path_buf(),
                    fstype,
                });
            }
            Ok(CpCloner {
                runner,
                flags: &["-a", "--reflink=always"],
            })
        }
        other => Err(CloneError::UnsupportedPlatform(other.into())),
    }
}

/// Resolve the filesystem personality of the volume holding `path` on
/// macOS: `df` finds the mountpoint, `diskutil info` names the
/// filesystem.
fn darwin_fstype(path: &Path, runner: &dyn Runner) -> Result<String> {
    let df = runner
        .output("df", &[path.display().to_string()])
        .map_err(|source| CloneError::Detect { source })?;
    let mountpoint = df
        .lines()
        .filter(|l| !l.trim().is_empty())
        .last()
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
        .ok_or_else(|| CloneError::DetectOutput {
            tool: "df",
            output: df.clone(),
        })?;

    let info = runner
        .output("diskutil", &["info".into(), mountpoint])
        .map_err(|source| CloneError::Detect { source })?;
    if info.contains("APFS") {
        Ok("APFS".into())
    } else {
        Ok("non-APFS".into())
    }
}

fn linux_fstype(path: &Path, runner: &dyn Runner) -> Result<String> {
    let out = runner
        .output(
            "stat",
            &[
                "-f".into(),
                "-c".into(),
                "%T".into(),
                path.display().to_string(),
            ],
        )
        .map_err(|source| CloneError::Detect { source })?;
    Ok(out.trim().to_string())
}

/// A `cp -v` line for one copied entry looks like `src -> dst`.
fn is_cp_verbose_entry(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && line.contains(" -> ")
}

/// Count all entries under `root`, root included.
pub(crate) fn count_entries(root: &Path) -> io::Result<usize> {
    let mut count = 1;
    if root.symlink_metadata()?.is_dir() {
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            count += count_entries(&entry.path())?;
        }
    }
    Ok(count)
}

/// Reject clones that would cross a volume boundary. When `dst` does
/// not exist yet its parent stands in for it.
///
/// # Errors
///
/// - Return [`CloneError::CrossDevice`] when source and destination
///   live on different devices.
pub(crate) fn ensure_same_filesystem(src: &Path, dst: &Path) -> Result<()> {
    let src_dev = device_id(src)?;

    let dst_probe = if dst.exists() {
        dst.to_path_buf()
    } else {
        dst.parent().map(Path::to_path_buf).unwrap_or_default()
    };
    let dst_dev = device_id(&dst_probe)?;

    if src_dev != dst_dev {
        return Err(CloneError::CrossDevice {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
    }
    Ok(())
}

fn device_id(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path).map_err(|source| CloneError::Preflight {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("device of {}: {}", path.display(), meta.dev());
    Ok(meta.dev())
}

/// Clone failure modes.
#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    #[error(
        "filesystem at {} does not support copy-on-write clones (detected {fstype}).\nGrove requires APFS (macOS) or btrfs/xfs with reflink support (Linux)",
        path.display()
    )]
    UnsupportedFilesystem { path: PathBuf, fstype: String },

    #[error("no copy-on-write clone support for platform {0:?}")]
    UnsupportedPlatform(String),

    #[error(
        "source and destination must be on the same filesystem for copy-on-write clones (source: {}, destination: {}).\nSet workspace_dir to a path on the same volume as the golden copy",
        src.display(),
        dst.display()
    )]
    CrossDevice { src: PathBuf, dst: PathBuf },

    #[error("clone preflight failed: stat {}", path.display())]
    Preflight {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("filesystem detection failed")]
    Detect {
        #[source]
        source: RunnerError,
    },

    #[error("filesystem detection failed: unexpected {tool} output:\n{output}")]
    DetectOutput { tool: &'static str, output: String },

    #[error("clone failed")]
    CloneFailed {
        #[source]
        source: RunnerError,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = CloneError> = std::result::Result<T, E>;
