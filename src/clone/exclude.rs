// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Exclude patterns and selective cloning.
//!
//! When a configuration carries `exclude` patterns, a workspace clone
//! cannot be a single whole-tree `cp`: excluded entries must never
//! reach the workspace. The planner walks the golden copy once,
//! counting what survives and remembering which directories contain an
//! excluded descendant. The executor then recreates only those
//! directories by hand and hands every untouched subtree to the
//! copy-on-write cloner whole, so block sharing is preserved wherever
//! nothing was filtered out.
//!
//! Patterns follow shell glob syntax where `/` is never matched by a
//! wildcard. A pattern without `/` matches against the base name of
//! every entry; a pattern containing `/` matches against the path
//! relative to the golden copy root. The `.grove` control directory
//! must reach every workspace, so patterns never match it and it is
//! cloned like any other entry.

use crate::clone::{CloneError, ClonePhase, CloneProgress, Cloner, ProgressEvent, Result};

use glob::{MatchOptions, Pattern};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::trace;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

struct CompiledPattern {
    pattern: Pattern,
    // Patterns with a separator match the relative path, the rest
    // match base names.
    full_path: bool,
}

/// A compiled set of exclude patterns.
pub struct ExcludeSet {
    patterns: Vec<CompiledPattern>,
}

/// An exclude pattern that does not compile.
#[derive(Debug, thiserror::Error)]
#[error("invalid exclude pattern {pattern:?}")]
pub struct ExcludeError {
    pub pattern: String,
    #[source]
    pub source: glob::PatternError,
}

impl ExcludeSet {
    /// Compile `patterns`.
    ///
    /// # Errors
    ///
    /// - Return [`ExcludeError`] naming the first malformed pattern.
    pub fn new(patterns: &[String]) -> std::result::Result<Self, ExcludeError> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                let pattern = Pattern::new(raw).map_err(|source| ExcludeError {
                    pattern: raw.clone(),
                    source,
                })?;
                Ok(CompiledPattern {
                    pattern,
                    full_path: raw.contains('/'),
                })
            })
            .collect::<std::result::Result<_, ExcludeError>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether the entry at `rel` (a `/`-separated path relative to the
    /// golden copy root) is excluded from cloning.
    ///
    /// The `.grove` control directory must survive into every
    /// workspace and is never reported excluded, whatever the
    /// patterns say.
    pub fn is_excluded(&self, rel: &str) -> bool {
        if rel == crate::store::GROVE_DIR || rel.starts_with(".grove/") {
            return false;
        }
        let base = rel.rsplit('/').next().unwrap_or(rel);
        self.patterns.iter().any(|p| {
            let subject = if p.full_path { rel } else { base };
            p.pattern.matches_with(subject, MATCH_OPTIONS)
        })
    }
}

/// What a selective clone will copy.
pub struct ClonePlan {
    /// Entries that survive the excludes, golden copy root included.
    pub total_entries: usize,
    dirs_with_excludes: HashSet<String>,
}

impl ClonePlan {
    /// Whether the directory at `rel` contains an excluded descendant
    /// and must be recreated entry by entry instead of cloned whole.
    fn must_descend(&self, rel: &str) -> bool {
        self.dirs_with_excludes.contains(rel)
    }
}

/// Walk the golden copy and build the plan for `excludes`.
///
/// Excluded directories are not descended into.
///
/// # Errors
///
/// - Return [`CloneError::Io`] if the walk fails.
pub fn build_plan(src: &Path, excludes: &ExcludeSet) -> Result<ClonePlan> {
    let mut plan = ClonePlan {
        total_entries: 1, // the root itself
        dirs_with_excludes: HashSet::new(),
    };
    walk(src, ".", excludes, &mut plan)?;
    trace!(
        total = plan.total_entries,
        mixed_dirs = plan.dirs_with_excludes.len(),
        "clone plan built"
    );
    Ok(plan)
}

fn walk(dir: &Path, rel: &str, excludes: &ExcludeSet, plan: &mut ClonePlan) -> Result<()> {
    for entry in sorted_entries(dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_rel = join_rel(rel, &name);

        if excludes.is_excluded(&child_rel) {
            mark_ancestors(&child_rel, plan);
            continue;
        }

        plan.total_entries += 1;
        if entry.file_type().map_err(CloneError::Io)?.is_dir() {
            walk(&entry.path(), &child_rel, excludes, plan)?;
        }
    }
    Ok(())
}

fn mark_ancestors(rel: &str, plan: &mut ClonePlan) {
    plan.dirs_with_excludes.insert(".".into());
    let mut end = 0;
    while let Some(at) = rel[end..].find('/') {
        end += at;
        plan.dirs_with_excludes.insert(rel[..end].into());
        end += 1;
    }
}

fn join_rel(rel: &str, name: &str) -> String {
    if rel == "." {
        name.to_string()
    } else {
        format!("{rel}/{name}")
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let mut entries = fs::read_dir(dir)
        .map_err(CloneError::Io)?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(CloneError::Io)?;
    entries.sort_by_key(fs::DirEntry::file_name);
    Ok(entries)
}

/// Clone `src` to `dst` honoring `excludes`.
///
/// # Errors
///
/// - Return [`CloneError`] if planning, directory creation, or any
///   subtree clone fails.
pub fn selective_clone(
    cloner: &dyn Cloner,
    src: &Path,
    dst: &Path,
    excludes: &ExcludeSet,
) -> Result<()> {
    if excludes.is_empty() {
        return cloner.clone_tree(src, dst);
    }
    let plan = build_plan(src, excludes)?;
    execute(cloner, src, dst, ".", excludes, &plan, None)
}

/// [`selective_clone`] with progress events. The totals come from the
/// plan, and entries cloned inside whole subtrees are folded into the
/// running count as the cloner reports them.
///
/// # Errors
///
/// Same contract as [`selective_clone`].
pub fn selective_clone_with_progress(
    cloner: &dyn Cloner,
    src: &Path,
    dst: &Path,
    excludes: &ExcludeSet,
    on_progress: CloneProgress<'_>,
) -> Result<()> {
    if excludes.is_empty() {
        return cloner.clone_tree_with_progress(src, dst, on_progress);
    }

    let plan = build_plan(src, excludes)?;
    on_progress(ProgressEvent {
        phase: ClonePhase::Scan,
        copied: 0,
        total: plan.total_entries,
    });

    let mut accum = ProgressAccum {
        copied: 0,
        total: plan.total_entries,
        on_progress,
    };
    execute(cloner, src, dst, ".", excludes, &plan, Some(&mut accum))
}

struct ProgressAccum<'a> {
    copied: usize,
    total: usize,
    on_progress: CloneProgress<'a>,
}

impl ProgressAccum<'_> {
    fn advance(&mut self, entries: usize) {
        self.copied = (self.copied + entries).min(self.total);
        (self.on_progress)(ProgressEvent {
            phase: ClonePhase::Clone,
            copied: self.copied,
            total: self.total,
        });
    }
}

fn execute(
    cloner: &dyn Cloner,
    src_root: &Path,
    dst_root: &Path,
    rel: &str,
    excludes: &ExcludeSet,
    plan: &ClonePlan,
    mut progress: Option<&mut ProgressAccum<'_>>,
) -> Result<()> {
    let src_dir = resolve(src_root, rel);
    let dst_dir = resolve(dst_root, rel);
    fs::create_dir_all(&dst_dir).map_err(CloneError::Io)?;
    if let Some(p) = progress.as_deref_mut() {
        p.advance(1);
    }

    for entry in sorted_entries(&src_dir)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_rel = join_rel(rel, &name);
        if excludes.is_excluded(&child_rel) {
            continue;
        }

        let is_dir = entry.file_type().map_err(CloneError::Io)?.is_dir();
        if is_dir && plan.must_descend(&child_rel) {
            execute(
                cloner,
                src_root,
                dst_root,
                &child_rel,
                excludes,
                plan,
                progress.as_deref_mut(),
            )?;
            continue;
        }

        let child_src = entry.path();
        let child_dst = dst_dir.join(&name);
        match progress.as_deref_mut() {
            Some(p) => {
                let mut seen = 0usize;
                let p = &mut *p;
                cloner.clone_tree_with_progress(&child_src, &child_dst, &mut |event| {
                    if event.phase == ClonePhase::Clone && event.copied > seen {
                        let delta = event.copied - seen;
                        seen = event.copied;
                        p.advance(delta);
                    }
                })?;
            }
            None => cloner.clone_tree(&child_src, &child_dst)?,
        }
    }
    Ok(())
}

fn resolve(root: &Path, rel: &str) -> PathBuf {
    if rel == "." {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn set(patterns: &[&str]) -> ExcludeSet {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        ExcludeSet::new(&patterns).expect("patterns must compile")
    }

    #[test_case("node_modules", "node_modules", true; "basename at root")]
    #[test_case("node_modules", "web/node_modules", true; "basename nested")]
    #[test_case("*.log", "build/server.log", true; "glob basename nested")]
    #[test_case("*.log", "server.log.bak", false; "suffix must match exactly")]
    #[test_case("build/cache", "build/cache", true; "full path")]
    #[test_case("build/cache", "other/build/cache", false; "full path is anchored")]
    #[test_case("build/*", "build/out", true; "full path glob")]
    #[test_case("build/*", "build/sub/out", false; "wildcard stops at separator")]
    #[test]
    fn pattern_matching(pattern: &str, rel: &str, expect: bool) {
        use pretty_assertions::assert_eq;
        assert_eq!(set(&[pattern]).is_excluded(rel), expect);
    }

    #[test]
    fn control_directory_is_never_excluded_by_patterns() {
        let excludes = set(&[".*", ".grove"]);
        assert!(!excludes.is_excluded(".grove"));
        assert!(!excludes.is_excluded(".grove/config.json"));
        assert!(excludes.is_excluded(".env"));
    }

    /// In-process cloner backed by a plain recursive copy, standing in
    /// for the CoW tool.
    struct CopyCloner;

    impl CopyCloner {
        fn copy(src: &Path, dst: &Path, copied: &mut usize) -> std::io::Result<()> {
            *copied += 1;
            if src.symlink_metadata()?.is_dir() {
                fs::create_dir_all(dst)?;
                for entry in fs::read_dir(src)? {
                    let entry = entry?;
                    Self::copy(&entry.path(), &dst.join(entry.file_name()), copied)?;
                }
            } else {
                fs::copy(src, dst)?;
            }
            Ok(())
        }
    }

    impl Cloner for CopyCloner {
        fn clone_tree(&self, src: &Path, dst: &Path) -> Result<()> {
            let mut copied = 0;
            Self::copy(src, dst, &mut copied).map_err(CloneError::Io)
        }

        fn clone_tree_with_progress(
            &self,
            src: &Path,
            dst: &Path,
            on_progress: CloneProgress<'_>,
        ) -> Result<()> {
            let total = crate::clone::count_entries(src).map_err(CloneError::Io)?;
            on_progress(ProgressEvent {
                phase: ClonePhase::Scan,
                copied: 0,
                total,
            });
            let mut copied = 0;
            Self::copy(src, dst, &mut copied).map_err(CloneError::Io)?;
            // Report entries in one batch once the subtree landed.
            on_progress(ProgressEvent {
                phase: ClonePhase::Clone,
                copied,
                total,
            });
            Ok(())
        }
    }

    fn golden() -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::create_dir_all(root.join("src"))?;
        fs::create_dir_all(root.join("web/node_modules/pkg"))?;
        fs::create_dir_all(root.join("build"))?;
        fs::create_dir_all(root.join(".grove"))?;
        fs::write(root.join("README.md"), "readme")?;
        fs::write(root.join("src/main.rs"), "fn main() {}")?;
        fs::write(root.join("web/app.js"), "app")?;
        fs::write(root.join("web/node_modules/pkg/index.js"), "pkg")?;
        fs::write(root.join("build/out.log"), "log")?;
        fs::write(root.join(".grove/config.json"), "{}")?;
        Ok(dir)
    }

    #[test]
    fn plan_counts_survivors_and_marks_mixed_dirs() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let dir = golden()?;
        let excludes = set(&["node_modules", "*.log"]);

        let plan = build_plan(dir.path(), &excludes)?;

        // root, .grove, .grove/config.json, README.md, build, src,
        // src/main.rs, web, web/app.js
        assert_eq!(plan.total_entries, 9);
        assert!(plan.must_descend("."));
        assert!(plan.must_descend("web"));
        assert!(plan.must_descend("build"));
        assert!(!plan.must_descend("src"));
        assert!(!plan.must_descend(".grove"));
        Ok(())
    }

    #[test]
    fn selective_clone_skips_excluded_entries() -> anyhow::Result<()> {
        let dir = golden()?;
        let out = tempfile::tempdir()?;
        let dst = out.path().join("ws");
        let excludes = set(&["node_modules", "*.log"]);

        selective_clone(&CopyCloner, dir.path(), &dst, &excludes)?;

        assert!(dst.join("src/main.rs").is_file());
        assert!(dst.join("web/app.js").is_file());
        assert!(dst.join("build").is_dir());
        assert!(!dst.join("web/node_modules").exists());
        assert!(!dst.join("build/out.log").exists());
        Ok(())
    }

    #[test]
    fn control_directory_survives_a_selective_clone() -> anyhow::Result<()> {
        let dir = golden()?;
        let out = tempfile::tempdir()?;
        let dst = out.path().join("ws");

        selective_clone(&CopyCloner, dir.path(), &dst, &set(&["node_modules", ".*"]))?;

        assert!(dst.join(".grove/config.json").is_file());
        assert!(!dst.join("web/node_modules").exists());
        Ok(())
    }

    #[test]
    fn no_excludes_clones_the_whole_tree_at_once() -> anyhow::Result<()> {
        let dir = golden()?;
        let out = tempfile::tempdir()?;
        let dst = out.path().join("ws");

        selective_clone(&CopyCloner, dir.path(), &dst, &set(&[]))?;

        assert!(dst.join(".grove").exists());
        assert!(dst.join("web/node_modules/pkg/index.js").is_file());
        Ok(())
    }

    #[test]
    fn progress_is_monotone_and_ends_at_total() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let dir = golden()?;
        let out = tempfile::tempdir()?;
        let dst = out.path().join("ws");
        let excludes = set(&["node_modules", "*.log"]);

        let mut events = Vec::new();
        selective_clone_with_progress(&CopyCloner, dir.path(), &dst, &excludes, &mut |e| {
            events.push(e)
        })?;

        assert_eq!(events[0].phase, ClonePhase::Scan);
        assert_eq!(events[0].total, 9);

        let counts: Vec<_> = events
            .iter()
            .filter(|e| e.phase == ClonePhase::Clone)
            .map(|e| e.copied)
            .collect();
        assert!(counts.windows(2).all(|w| w[0] <= w[1]), "counts: {counts:?}");
        assert_eq!(counts.last(), Some(&9));
        Ok(())
    }
}
