// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Base image lifecycle and image workspace plumbing.
//!
//! The base image is initialized once (create, attach, sync the
//! project in, detach) and refreshed by `update` when no workspace is
//! mounted on it. A workspace is the base attached read-through with a
//! fresh shadow overlay; the attach happens directly at the workspace
//! path, so to the user an image workspace looks exactly like a tree
//! one.
//!
//! Every step that acquires an external resource is compensated in
//! reverse order when a later step fails: a failed sync still
//! detaches, a failed metadata write detaches and removes the shadow.

use crate::image::{
    self, commands, commands::PercentSink, ImageError, ImageState, ImageWorkspace, Result,
};
use crate::runner::Runner;
use crate::store;

use std::{fs, io, path::Path};
use tracing::{debug, warn};

/// Volume label of the base image.
pub const BASE_VOLNAME: &str = "grove-base";

/// Default base image size in gigabytes.
pub const DEFAULT_SIZE_GB: i64 = 200;

const MIN_SIZE_GB: u64 = 20;

fn effective_size(size_gb: i64) -> u64 {
    if size_gb <= 0 {
        MIN_SIZE_GB
    } else {
        size_gb as u64
    }
}

/// Initialize the base image: create the sparse bundle, mount it,
/// sync the project tree in, unmount, and record generation 1.
///
/// # Errors
///
/// - Return [`ImageError::Command`] if any tool invocation fails.
/// - Return [`ImageError::Store`] if the state cannot be persisted.
pub fn init_base(
    root: &Path,
    runner: &dyn Runner,
    size_gb: i64,
    excludes: &[String],
    on_percent: Option<PercentSink<'_>>,
) -> Result<ImageState> {
    let base_path = store::base_bundle_path(root);
    let mountpoint = store::base_mountpoint(root);
    make_dir(&store::images_dir(root))?;
    make_dir(&mountpoint)?;

    commands::create_sparse_bundle(runner, &base_path, BASE_VOLNAME, effective_size(size_gb))?;

    let vol = commands::attach(runner, &base_path, &mountpoint)?;
    let synced = match on_percent {
        Some(on_percent) => {
            commands::sync_base_with_progress(runner, root, &vol.mountpoint, excludes, on_percent)
        }
        None => commands::sync_base(runner, root, &vol.mountpoint, excludes),
    };
    let detached = commands::detach(runner, &vol.device);
    synced?;
    detached?;

    let state = ImageState {
        backend: "image".into(),
        base_path,
        base_generation: 1,
        last_sync_commit: None,
    };
    image::save_state(root, &state)?;
    debug!("base image initialized at generation 1");
    Ok(state)
}

/// Re-sync the base image from the project tree, bumping the
/// generation and recording the synced commit.
///
/// # Errors
///
/// - Return [`ImageError::ActiveWorkspaces`] while any image workspace
///   exists; their shadows reference the current base bytes.
/// - Return [`ImageError::StateMissing`] if the backend was never
///   initialized.
/// - Return [`ImageError::Command`] if any tool invocation fails.
pub fn refresh_base(
    root: &Path,
    runner: &dyn Runner,
    commit: &str,
    excludes: &[String],
) -> Result<ImageState> {
    let live = image::list_workspaces(root)?;
    if !live.is_empty() {
        return Err(ImageError::ActiveWorkspaces(live.len()));
    }

    let mut state = image::load_state(root)?.ok_or(ImageError::StateMissing)?;
    if state.base_path.as_os_str().is_empty() {
        state.base_path = store::base_bundle_path(root);
    }

    let mountpoint = store::base_mountpoint(root);
    make_dir(&mountpoint)?;

    let vol = commands::attach(runner, &state.base_path, &mountpoint)?;
    let synced = commands::sync_base(runner, root, &vol.mountpoint, excludes);
    let detached = commands::detach(runner, &vol.device);
    synced?;
    detached?;

    state.backend = "image".into();
    state.base_generation += 1;
    state.last_sync_commit = Some(commit.to_string());
    image::save_state(root, &state)?;
    debug!(generation = state.base_generation, "base image refreshed");
    Ok(state)
}

/// Mount a new image workspace at `workspace_path` and record its
/// metadata.
///
/// # Errors
///
/// - Return [`ImageError::StateMissing`] if the backend was never
///   initialized.
/// - Return [`ImageError::Command`] if the attach fails.
/// - Return [`ImageError::Store`] if the metadata write fails; the
///   attach and shadow are rolled back first.
pub fn create_workspace(
    root: &Path,
    runner: &dyn Runner,
    id: &str,
    workspace_path: &Path,
) -> Result<ImageWorkspace> {
    let state = image::load_state(root)?.ok_or(ImageError::StateMissing)?;

    make_dir(workspace_path)?;
    let shadow_path = store::shadow_path(root, id);
    make_dir(&store::shadows_dir(root))?;

    let vol = commands::attach_with_shadow(runner, &state.base_path, &shadow_path, workspace_path)?;

    let meta = ImageWorkspace {
        id: id.to_string(),
        mountpoint: workspace_path.to_path_buf(),
        device: vol.device.clone(),
        shadow_path: shadow_path.clone(),
        base_generation: state.base_generation,
        created_at: crate::time::now_utc(),
    };
    if let Err(err) = image::save_workspace(root, &meta) {
        if let Err(detach_err) = commands::detach(runner, &vol.device) {
            warn!("cleanup detach of {} failed: {detach_err}", vol.device);
        }
        if let Err(rm_err) = fs::remove_file(&shadow_path) {
            if rm_err.kind() != io::ErrorKind::NotFound {
                warn!("cleanup of shadow {} failed: {rm_err}", shadow_path.display());
            }
        }
        return Err(err);
    }
    Ok(meta)
}

/// Tear an image workspace down: detach its device, then remove the
/// shadow, the metadata record, and the mountpoint, in that order.
///
/// # Errors
///
/// - Return [`ImageError::MetaMissing`] if no metadata record exists.
/// - Return [`ImageError::Command`] if the detach fails; nothing is
///   removed in that case.
pub fn destroy_workspace(root: &Path, runner: &dyn Runner, id: &str) -> Result<()> {
    let meta = image::load_workspace(root, id)?.ok_or_else(|| ImageError::MetaMissing(id.into()))?;

    commands::detach(runner, &meta.device)?;

    match fs::remove_file(&meta.shadow_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ImageError::Io {
                path: meta.shadow_path.clone(),
                source,
            })
        }
    }
    image::delete_workspace(root, id)?;

    match fs::remove_dir_all(&meta.mountpoint) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ImageError::Io {
            path: meta.mountpoint.clone(),
            source,
        }),
    }
}

fn make_dir(path: &Path) -> Result<()> {
    mkdirp::mkdirp(path)
        .map(|_| ())
        .map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{FakeRunner, Script};
    use pretty_assertions::assert_eq;

    fn attach_plist(device: &str, mountpoint: &Path) -> String {
        format!(
            "<dict><key>dev-entry</key><string>{device}</string>\
             <key>mount-point</key><string>{}</string></dict>",
            mountpoint.display()
        )
    }

    fn programs(runner: &FakeRunner) -> Vec<String> {
        runner.calls.borrow().iter().map(|(p, _)| p.clone()).collect()
    }

    #[test]
    fn init_runs_create_attach_sync_detach_and_records_generation_one() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = FakeRunner::new();
        runner.push(Script::ok()); // hdiutil create
        runner.push(Script::with_output(attach_plist(
            "/dev/disk5s1",
            &store::base_mountpoint(dir.path()),
        )));
        runner.push(Script::ok()); // rsync
        runner.push(Script::ok()); // hdiutil detach

        let state = init_base(dir.path(), &runner, 5, &[], None)?;

        assert_eq!(programs(&runner), vec!["hdiutil", "hdiutil", "rsync", "hdiutil"]);
        assert_eq!(state.base_generation, 1);
        assert_eq!(state.base_path, store::base_bundle_path(dir.path()));
        assert_eq!(image::load_state(dir.path())?, Some(state));
        Ok(())
    }

    #[test]
    fn init_clamps_non_positive_sizes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = FakeRunner::new();
        runner.push(Script::ok());
        runner.push(Script::with_output(attach_plist(
            "/dev/disk5s1",
            &store::base_mountpoint(dir.path()),
        )));
        runner.push(Script::ok());
        runner.push(Script::ok());

        init_base(dir.path(), &runner, 0, &[], None)?;

        let create_args = runner.calls.borrow()[0].1.clone();
        assert!(create_args.contains(&"20g".to_string()), "args: {create_args:?}");
        Ok(())
    }

    #[test]
    fn init_detaches_even_when_the_sync_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = FakeRunner::new();
        runner.push(Script::ok());
        runner.push(Script::with_output(attach_plist(
            "/dev/disk5s1",
            &store::base_mountpoint(dir.path()),
        )));
        runner.push(Script::fail("rsync: connection unexpectedly closed"));
        runner.push(Script::ok()); // detach still happens

        let err = init_base(dir.path(), &runner, 5, &[], None).unwrap_err();
        assert!(matches!(err, ImageError::Command { tool: "rsync", .. }));

        let calls = runner.calls.borrow();
        assert_eq!(calls.last().map(|(_, a)| a[0].clone()), Some("detach".into()));
        assert_eq!(image::load_state(dir.path())?, None);
        Ok(())
    }

    #[test]
    fn refresh_refuses_with_live_workspaces() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        image::save_workspace(
            dir.path(),
            &ImageWorkspace {
                id: "fix-9a2b".into(),
                mountpoint: dir.path().join("ws"),
                device: "/dev/disk5s1".into(),
                shadow_path: store::shadow_path(dir.path(), "fix-9a2b"),
                base_generation: 1,
                created_at: crate::time::now_utc(),
            },
        )?;

        let runner = FakeRunner::new();
        let err = refresh_base(dir.path(), &runner, "abc1234", &[]).unwrap_err();
        assert!(matches!(err, ImageError::ActiveWorkspaces(1)));
        assert!(runner.calls.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn refresh_bumps_generation_and_records_the_commit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        image::save_state(
            dir.path(),
            &ImageState {
                backend: "image".into(),
                base_path: store::base_bundle_path(dir.path()),
                base_generation: 2,
                last_sync_commit: None,
            },
        )?;

        let runner = FakeRunner::new();
        runner.push(Script::with_output(attach_plist(
            "/dev/disk5s1",
            &store::base_mountpoint(dir.path()),
        )));
        runner.push(Script::ok()); // rsync
        runner.push(Script::ok()); // detach

        let state = refresh_base(dir.path(), &runner, "abc1234", &[])?;
        assert_eq!(state.base_generation, 3);
        assert_eq!(state.last_sync_commit.as_deref(), Some("abc1234"));
        Ok(())
    }

    #[test]
    fn refresh_without_state_reports_missing_backend() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = FakeRunner::new();
        assert!(matches!(
            refresh_base(dir.path(), &runner, "abc1234", &[]),
            Err(ImageError::StateMissing)
        ));
        Ok(())
    }

    #[test]
    fn workspace_create_records_device_shadow_and_generation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        image::save_state(
            dir.path(),
            &ImageState {
                backend: "image".into(),
                base_path: store::base_bundle_path(dir.path()),
                base_generation: 4,
                last_sync_commit: None,
            },
        )?;
        let ws = dir.path().join("ws").join("fix-9a2b");

        let runner = FakeRunner::new();
        runner.push(Script::with_output(attach_plist("/dev/disk6s1", &ws)));

        let meta = create_workspace(dir.path(), &runner, "fix-9a2b", &ws)?;

        assert_eq!(meta.device, "/dev/disk6s1");
        assert_eq!(meta.shadow_path, store::shadow_path(dir.path(), "fix-9a2b"));
        assert_eq!(meta.base_generation, 4);
        assert_eq!(image::load_workspace(dir.path(), "fix-9a2b")?, Some(meta));
        assert!(ws.is_dir());
        Ok(())
    }

    #[test]
    fn workspace_destroy_detaches_before_removing_anything() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws)?;
        let shadow = store::shadow_path(dir.path(), "fix-9a2b");
        std::fs::create_dir_all(store::shadows_dir(dir.path()))?;
        std::fs::write(&shadow, "overlay")?;
        image::save_workspace(
            dir.path(),
            &ImageWorkspace {
                id: "fix-9a2b".into(),
                mountpoint: ws.clone(),
                device: "/dev/disk6s1".into(),
                shadow_path: shadow.clone(),
                base_generation: 1,
                created_at: crate::time::now_utc(),
            },
        )?;

        let runner = FakeRunner::new();
        runner.push(Script::ok()); // detach

        destroy_workspace(dir.path(), &runner, "fix-9a2b")?;

        let (program, args) = runner.calls.borrow()[0].clone();
        assert_eq!((program.as_str(), args[0].as_str()), ("hdiutil", "detach"));
        assert!(!shadow.exists());
        assert_eq!(image::load_workspace(dir.path(), "fix-9a2b")?, None);
        assert!(!ws.exists());
        Ok(())
    }

    #[test]
    fn workspace_destroy_keeps_records_when_detach_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        image::save_workspace(
            dir.path(),
            &ImageWorkspace {
                id: "fix-9a2b".into(),
                mountpoint: dir.path().join("ws"),
                device: "/dev/disk6s1".into(),
                shadow_path: store::shadow_path(dir.path(), "fix-9a2b"),
                base_generation: 1,
                created_at: crate::time::now_utc(),
            },
        )?;

        let runner = FakeRunner::new();
        runner.push(Script::fail("Resource busy"));
        runner.push(Script::fail("Resource busy")); // retry also fails

        let err = destroy_workspace(dir.path(), &runner, "fix-9a2b").unwrap_err();
        assert!(matches!(err, ImageError::Command { op: "detach", .. }));
        assert!(image::load_workspace(dir.path(), "fix-9a2b")?.is_some());
        Ok(())
    }

    #[test]
    fn destroying_an_unknown_workspace_reports_missing_metadata() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = FakeRunner::new();
        assert!(matches!(
            destroy_workspace(dir.path(), &runner, "ghost-0000"),
            Err(ImageError::MetaMissing(_))
        ));
        Ok(())
    }
}
