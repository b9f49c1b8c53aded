// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Workspace identity and markers.
//!
//! A directory is a workspace iff it carries a
//! `.grove/workspace.json` marker naming its golden copy. Everything
//! here works off that marker: enumeration scans the workspace
//! directory for marked children, resolution accepts either an ID or
//! an absolute path, and IDs are minted as `<branch-slug>-<4 hex>`
//! with the slug dropped for branchless workspaces.

use crate::store::{self, StoreError};

use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};

/// Marker record of one workspace.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Info {
    pub id: String,
    pub golden_copy: PathBuf,
    pub golden_commit: String,
    pub created_at: String,
    pub branch: String,
    pub path: PathBuf,
}

/// Whether `path` carries a workspace marker.
pub fn is_workspace(path: &Path) -> bool {
    store::marker_path(path).is_file()
}

/// Write the marker of a workspace rooted at `info.path`.
///
/// # Errors
///
/// - Return [`WorkspaceError::Store`] on write failure.
pub fn write_marker(info: &Info) -> Result<()> {
    Ok(store::write_record(&store::marker_path(&info.path), info)?)
}

/// Read a workspace marker, fixing up the recorded path to where the
/// marker was actually found.
///
/// # Errors
///
/// - Return [`WorkspaceError::Store`] on unreadable or invalid marker.
pub fn read_marker(ws_path: &Path) -> Result<Option<Info>> {
    let info: Option<Info> = store::read_record(&store::marker_path(ws_path))?;
    Ok(info.map(|mut info| {
        info.path = ws_path.to_path_buf();
        info
    }))
}

/// All workspaces under `workspace_dir`, sorted by ID. Directories
/// without a readable marker are not workspaces and are skipped.
///
/// # Errors
///
/// - Return [`WorkspaceError::Io`] if the directory cannot be listed
///   (absence means no workspaces).
pub fn list(workspace_dir: &Path) -> Result<Vec<Info>> {
    let entries = match std::fs::read_dir(workspace_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(WorkspaceError::Io {
                path: workspace_dir.to_path_buf(),
                source,
            })
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| WorkspaceError::Io {
            path: workspace_dir.to_path_buf(),
            source,
        })?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(Some(info)) = read_marker(&entry.path()) {
            out.push(info);
        }
    }
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(out)
}

/// Resolve a workspace from an ID or an absolute path.
///
/// # Errors
///
/// - Return [`WorkspaceError::NotAWorkspace`] for an absolute path
///   without a marker.
/// - Return [`WorkspaceError::NotFound`] for an unknown ID.
pub fn resolve(workspace_dir: &Path, id_or_path: &str) -> Result<PathBuf> {
    let candidate = Path::new(id_or_path);
    if candidate.is_absolute() {
        return if is_workspace(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(WorkspaceError::NotAWorkspace(candidate.to_path_buf()))
        };
    }

    let ws_path = workspace_dir.join(id_or_path);
    if is_workspace(&ws_path) {
        Ok(ws_path)
    } else {
        Err(WorkspaceError::NotFound(id_or_path.to_string()))
    }
}

/// Resolve and read a workspace's marker in one step.
///
/// # Errors
///
/// Same contract as [`resolve`]; a marker that vanished between the
/// two steps reads as [`WorkspaceError::NotFound`].
pub fn get(workspace_dir: &Path, id_or_path: &str) -> Result<Info> {
    let ws_path = resolve(workspace_dir, id_or_path)?;
    read_marker(&ws_path)?.ok_or_else(|| WorkspaceError::NotFound(id_or_path.to_string()))
}

/// Convert a branch name to a filesystem-safe slug: lowercase
/// alphanumerics with runs of anything else collapsed to single
/// hyphens, leading and trailing hyphens trimmed, at most 20 bytes.
pub fn slugify(branch: &str) -> String {
    let mut slug = String::new();
    let mut pending_hyphen = false;
    for ch in branch.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_hyphen {
                slug.push('-');
                pending_hyphen = false;
            }
            slug.push(ch);
        } else if !slug.is_empty() {
            pending_hyphen = true;
        }
    }
    if slug.len() > 20 {
        slug.truncate(20);
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Mint a workspace ID: `<slug>-<4 hex>`, or bare hex when the branch
/// slugifies to nothing.
///
/// # Errors
///
/// - Return [`WorkspaceError::IdGeneration`] if the system randomness
///   source fails.
pub fn generate_id(branch: &str) -> Result<String> {
    let mut bytes = [0u8; 2];
    getrandom::fill(&mut bytes).map_err(WorkspaceError::IdGeneration)?;
    let suffix = format!("{:02x}{:02x}", bytes[0], bytes[1]);

    let slug = slugify(branch);
    if slug.is_empty() {
        Ok(suffix)
    } else {
        Ok(format!("{slug}-{suffix}"))
    }
}

const ID_ATTEMPTS: usize = 5;

/// Mint an ID that is free under `workspace_dir`, regenerating on
/// collision a bounded number of times.
///
/// # Errors
///
/// - Return [`WorkspaceError::IdGeneration`] on randomness failure.
/// - Return [`WorkspaceError::IdSpaceExhausted`] after too many
///   collisions.
pub fn unique_id(branch: &str, workspace_dir: &Path) -> Result<String> {
    unique_id_with(branch, |id| workspace_dir.join(id).exists())
}

fn unique_id_with(branch: &str, mut taken: impl FnMut(&str) -> bool) -> Result<String> {
    for _ in 0..ID_ATTEMPTS {
        let id = generate_id(branch)?;
        if !taken(&id) {
            return Ok(id);
        }
    }
    Err(WorkspaceError::IdSpaceExhausted {
        slug: slugify(branch),
    })
}

/// Workspace error types.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("not a grove workspace: {}", .0.display())]
    NotAWorkspace(PathBuf),

    #[error("workspace not found: {0}")]
    NotFound(String),

    #[error("cannot generate workspace ID")]
    IdGeneration(#[source] getrandom::Error),

    #[error("could not find a free workspace ID for slug {slug:?}")]
    IdSpaceExhausted { slug: String },

    #[error("workspace i/o failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn info(id: &str, path: &Path) -> Info {
        Info {
            id: id.into(),
            golden_copy: PathBuf::from("/proj"),
            golden_commit: "abc1234".into(),
            created_at: "2025-06-01T12:00:00Z".into(),
            branch: "fix/bug-123".into(),
            path: path.to_path_buf(),
        }
    }

    #[test_case("fix/bug-123", "fix-bug-123"; "slashes become hyphens")]
    #[test_case("Feature/ABC_123", "feature-abc-123"; "lowercased")]
    #[test_case("--weird--", "weird"; "leading and trailing trimmed")]
    #[test_case("a//b", "a-b"; "runs collapse")]
    #[test_case("", ""; "empty stays empty")]
    #[test_case("!!!", ""; "nothing usable")]
    #[test_case("a-very-long-branch-name-indeed", "a-very-long-branch-n"; "truncated to twenty")]
    #[test_case("this-is-twenty-chars-x", "this-is-twenty-chars"; "truncation trims trailing hyphen")]
    #[test]
    fn slugify_table(branch: &str, expect: &str) {
        use pretty_assertions::assert_eq;
        assert_eq!(slugify(branch), expect);
    }

    #[test]
    fn generated_ids_carry_slug_and_hex_suffix() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let id = generate_id("fix/bug-123")?;
        let suffix = id.strip_prefix("fix-bug-123-").expect("slug prefix");
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

        let bare = generate_id("")?;
        assert_eq!(bare.len(), 4);
        Ok(())
    }

    #[test]
    fn unique_id_retries_collisions_a_bounded_number_of_times() -> anyhow::Result<()> {
        let mut seen = 0;
        let id = unique_id_with("fix", |_| {
            seen += 1;
            seen < 3
        });
        assert!(id?.starts_with("fix-"));

        let err = unique_id_with("fix", |_| true).unwrap_err();
        assert!(matches!(err, WorkspaceError::IdSpaceExhausted { .. }));
        Ok(())
    }

    #[test]
    fn marker_round_trips_and_pins_the_found_path() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let dir = tempfile::tempdir()?;
        let ws = dir.path().join("fix-9a2b");
        std::fs::create_dir_all(&ws)?;
        write_marker(&info("fix-9a2b", &ws))?;

        // A workspace moved wholesale reads back with its new location,
        // not the recorded one.
        let stale = Info {
            golden_commit: "def5678".into(),
            path: PathBuf::from("/somewhere/stale"),
            ..info("fix-9a2b", &ws)
        };
        store::write_record(&store::marker_path(&ws), &stale)?;

        let read = read_marker(&ws)?.expect("marker present");
        assert_eq!(read.path, ws);
        assert_eq!(read.golden_commit, "def5678");
        Ok(())
    }

    #[test]
    fn list_skips_unmarked_and_broken_directories() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let dir = tempfile::tempdir()?;
        let good = dir.path().join("fix-9a2b");
        std::fs::create_dir_all(&good)?;
        write_marker(&info("fix-9a2b", &good))?;

        std::fs::create_dir_all(dir.path().join("plain-dir"))?;
        let broken = dir.path().join("broken");
        std::fs::create_dir_all(broken.join(".grove"))?;
        std::fs::write(store::marker_path(&broken), "not json")?;
        std::fs::write(dir.path().join("stray-file"), "")?;

        let ids: Vec<_> = list(dir.path())?.into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["fix-9a2b"]);
        Ok(())
    }

    #[test]
    fn list_of_missing_directory_is_empty() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let dir = tempfile::tempdir()?;
        assert_eq!(list(&dir.path().join("never-created"))?.len(), 0);
        Ok(())
    }

    #[test]
    fn resolve_accepts_ids_and_absolute_paths() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let dir = tempfile::tempdir()?;
        let ws = dir.path().join("fix-9a2b");
        std::fs::create_dir_all(&ws)?;
        write_marker(&info("fix-9a2b", &ws))?;

        assert_eq!(resolve(dir.path(), "fix-9a2b")?, ws);
        assert_eq!(resolve(dir.path(), &ws.display().to_string())?, ws);

        assert!(matches!(
            resolve(dir.path(), "ghost-0000"),
            Err(WorkspaceError::NotFound(_))
        ));
        assert!(matches!(
            resolve(dir.path(), &dir.path().display().to_string()),
            Err(WorkspaceError::NotAWorkspace(_))
        ));
        Ok(())
    }

    #[test]
    fn get_reads_the_marker_behind_the_resolution() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let dir = tempfile::tempdir()?;
        let ws = dir.path().join("fix-9a2b");
        std::fs::create_dir_all(&ws)?;
        write_marker(&info("fix-9a2b", &ws))?;

        let got = get(dir.path(), "fix-9a2b")?;
        assert_eq!(got.branch, "fix/bug-123");
        assert_eq!(got.path, ws);
        Ok(())
    }
}
