// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Version control adapter.
//!
//! Grove treats the VCS as an opaque external tool reached through the
//! command runner. Only the handful of questions and actions the
//! workspace lifecycle needs are exposed here; everything else about
//! the repository is none of grove's business.

use crate::runner::{Runner, RunnerError};

use std::path::Path;
use tracing::warn;

/// Git reached through the external `git` binary.
pub struct GitCli<'r> {
    runner: &'r dyn Runner,
}

impl<'r> GitCli<'r> {
    pub fn new(runner: &'r dyn Runner) -> Self {
        Self { runner }
    }

    fn git(&self, path: &Path, args: &[&str]) -> Result<String, RunnerError> {
        let mut full: Vec<String> = vec!["-C".into(), path.display().to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.runner.output("git", &full)
    }

    /// Whether `path` is inside a git working tree.
    pub fn is_repo(&self, path: &Path) -> bool {
        self.git(path, &["rev-parse", "--git-dir"]).is_ok()
    }

    /// Whether the repository at `path` has uncommitted changes.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError`] if the status query fails.
    pub fn is_dirty(&self, path: &Path) -> Result<bool> {
        let out = self
            .git(path, &["status", "--porcelain"])
            .map_err(|source| VcsError::new("status", source))?;
        Ok(!out.trim().is_empty())
    }

    /// Current branch name, empty on a detached HEAD.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError`] if the query fails.
    pub fn current_branch(&self, path: &Path) -> Result<String> {
        let out = self
            .git(path, &["branch", "--show-current"])
            .map_err(|source| VcsError::new("branch", source))?;
        Ok(out.trim().to_string())
    }

    /// Short commit identifier of HEAD.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError`] if the query fails.
    pub fn current_commit(&self, path: &Path) -> Result<String> {
        let out = self
            .git(path, &["rev-parse", "--short", "HEAD"])
            .map_err(|source| VcsError::new("rev-parse", source))?;
        Ok(out.trim().to_string())
    }

    /// Pull the current branch.
    ///
    /// When no upstream is configured, falls back to an explicit
    /// `pull origin <branch>` and sets tracking afterward so the next
    /// pull works unaided. A failure to set tracking is only a warning.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError`] if the pull itself fails.
    pub fn pull(&self, path: &Path) -> Result<()> {
        if self.has_upstream(path) {
            self.git(path, &["pull"])
                .map_err(|source| VcsError::new("pull", source))?;
            return Ok(());
        }

        let branch = self.current_branch(path)?;
        self.git(path, &["pull", "origin", &branch])
            .map_err(|source| VcsError::new("pull", source))?;

        let upstream = format!("origin/{branch}");
        if let Err(err) = self.git(path, &["branch", "--set-upstream-to", &upstream, &branch]) {
            warn!("could not set upstream tracking for {branch}: {err}");
        }
        Ok(())
    }

    /// Push `branch` to origin, setting upstream tracking.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError`] if the push fails.
    pub fn push(&self, path: &Path, branch: &str) -> Result<()> {
        self.git(path, &["push", "-u", "origin", branch])
            .map_err(|source| VcsError::new("push", source))?;
        Ok(())
    }

    /// Check out `branch`, creating it first when `create` is set.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError`] if the checkout fails.
    pub fn checkout(&self, path: &Path, branch: &str, create: bool) -> Result<()> {
        let args: &[&str] = if create {
            &["checkout", "-b", branch]
        } else {
            &["checkout", branch]
        };
        self.git(path, args)
            .map_err(|source| VcsError::new("checkout", source))?;
        Ok(())
    }

    fn has_upstream(&self, path: &Path) -> bool {
        self.git(
            path,
            &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
        )
        .is_ok()
    }
}

/// A git invocation failed; the source carries the combined output.
#[derive(Debug, thiserror::Error)]
#[error("git {op} failed")]
pub struct VcsError {
    op: &'static str,
    #[source]
    source: RunnerError,
}

impl VcsError {
    fn new(op: &'static str, source: RunnerError) -> Self {
        Self { op, source }
    }

    /// Combined output of the failed git command.
    pub fn output(&self) -> &str {
        self.source.output()
    }
}

/// Friendly result alias :3
pub type Result<T, E = VcsError> = std::result::Result<T, E>;
