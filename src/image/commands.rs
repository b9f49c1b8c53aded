// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Disk image tool invocations.
//!
//! Thin wrappers over the platform disk image tool (`hdiutil`) and
//! `rsync`, reached through the command runner. Attach output is
//! requested as a plist and scraped for the `dev-entry` /
//! `mount-point` pair of the mounted volume; sync progress comes from
//! rsync's `--info=progress2` percent lines, which arrive separated by
//! carriage returns rather than newlines.

use crate::image::{ImageError, Result};
use crate::runner::Runner;

use regex::Regex;
use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tracing::debug;

/// An attached disk image volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedVolume {
    pub device: String,
    pub mountpoint: PathBuf,
}

/// Percent callback for base syncs.
pub type PercentSink<'a> = &'a mut (dyn FnMut(u8) + Send);

fn dict_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<dict>(.*?)</dict>").expect("valid regex"))
}

fn key_string_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<key>\s*([^<]+?)\s*</key>\s*<string>\s*([^<]+?)\s*</string>")
            .expect("valid regex")
    })
}

fn percent_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s(\d+)%").expect("valid regex"))
}

/// Create a sparse, expandable disk image with an APFS volume.
///
/// # Errors
///
/// - Return [`ImageError::Command`] if the tool fails.
pub fn create_sparse_bundle(
    runner: &dyn Runner,
    path: &Path,
    volname: &str,
    size_gb: u64,
) -> Result<()> {
    let args = vec![
        "create".to_string(),
        "-type".into(),
        "SPARSEBUNDLE".into(),
        "-fs".into(),
        "APFS".into(),
        "-size".into(),
        format!("{size_gb}g"),
        "-volname".into(),
        volname.into(),
        path.display().to_string(),
    ];
    runner
        .output("hdiutil", &args)
        .map_err(|source| ImageError::Command {
            tool: "hdiutil",
            op: "create",
            source,
        })?;
    Ok(())
}

/// Attach the base image at `mountpoint` without a shadow.
///
/// # Errors
///
/// - Return [`ImageError::Command`] if the tool fails.
/// - Return [`ImageError::ParseAttach`] if the plist lacks the volume.
pub fn attach(runner: &dyn Runner, base: &Path, mountpoint: &Path) -> Result<AttachedVolume> {
    run_attach(runner, base, None, mountpoint)
}

/// Attach the base image overlaid by `shadow`, which absorbs all
/// writes and leaves the base byte-identical.
///
/// # Errors
///
/// Same contract as [`attach`].
pub fn attach_with_shadow(
    runner: &dyn Runner,
    base: &Path,
    shadow: &Path,
    mountpoint: &Path,
) -> Result<AttachedVolume> {
    run_attach(runner, base, Some(shadow), mountpoint)
}

fn run_attach(
    runner: &dyn Runner,
    base: &Path,
    shadow: Option<&Path>,
    mountpoint: &Path,
) -> Result<AttachedVolume> {
    let mut args = vec!["attach".to_string(), base.display().to_string()];
    if let Some(shadow) = shadow {
        args.push("-shadow".into());
        args.push(shadow.display().to_string());
    }
    args.extend([
        "-mountpoint".to_string(),
        mountpoint.display().to_string(),
        "-nobrowse".into(),
        "-plist".into(),
    ]);

    let out = runner
        .output("hdiutil", &args)
        .map_err(|source| ImageError::Command {
            tool: "hdiutil",
            op: "attach",
            source,
        })?;
    let vol = parse_attached_volume(&out)?;
    debug!(device = %vol.device, mountpoint = %vol.mountpoint.display(), "attached");
    Ok(vol)
}

/// Detach `device`. A first failure (typically a transient "resource
/// busy") is retried once before giving up.
///
/// # Errors
///
/// - Return [`ImageError::Command`] if both attempts fail.
pub fn detach(runner: &dyn Runner, device: &str) -> Result<()> {
    let args = vec!["detach".to_string(), device.to_string()];
    if let Err(first) = runner.output("hdiutil", &args) {
        debug!(device, error = %first, "detach failed, retrying once");
        runner
            .output("hdiutil", &args)
            .map_err(|source| ImageError::Command {
                tool: "hdiutil",
                op: "detach",
                source,
            })?;
    }
    Ok(())
}

/// Sync the project tree into the mounted base volume.
///
/// # Errors
///
/// - Return [`ImageError::Command`] if rsync fails.
pub fn sync_base(runner: &dyn Runner, src: &Path, dst: &Path, excludes: &[String]) -> Result<()> {
    let args = sync_args(src, dst, excludes, false);
    runner
        .output("rsync", &args)
        .map_err(|source| ImageError::Command {
            tool: "rsync",
            op: "sync",
            source,
        })?;
    Ok(())
}

/// [`sync_base`] streaming the transfer percentage.
///
/// # Errors
///
/// Same contract as [`sync_base`].
pub fn sync_base_with_progress(
    runner: &dyn Runner,
    src: &Path,
    dst: &Path,
    excludes: &[String],
    on_percent: PercentSink<'_>,
) -> Result<()> {
    let args = sync_args(src, dst, excludes, true);
    runner
        .stream("rsync", &args, &mut |line| {
            if let Some(pct) = parse_rsync_percent(line) {
                on_percent(pct);
            }
        })
        .map_err(|source| ImageError::Command {
            tool: "rsync",
            op: "sync",
            source,
        })
}

fn sync_args(src: &Path, dst: &Path, excludes: &[String], progress: bool) -> Vec<String> {
    let mut args = vec!["-a".to_string(), "--delete".into()];
    if progress {
        args.push("--info=progress2".into());
        args.push("--no-inc-recursive".into());
    }
    // Never let the image swallow its own control state.
    for sub in ["images", "workspaces", "shadows", "mnt"] {
        args.push("--exclude".into());
        args.push(format!(".grove/{sub}/"));
    }
    for pattern in excludes {
        args.push("--exclude".into());
        args.push(pattern.clone());
    }
    args.push(trailing_slash(src));
    args.push(trailing_slash(dst));
    args
}

// rsync treats `src` and `src/` differently; grove always means the
// directory contents.
fn trailing_slash(path: &Path) -> String {
    let mut s = path.display().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

fn parse_rsync_percent(line: &str) -> Option<u8> {
    let captures = percent_pattern().captures(line)?;
    captures[1].parse().ok().filter(|pct| *pct <= 100)
}

fn parse_attached_volume(plist: &str) -> Result<AttachedVolume> {
    for dict in dict_pattern().captures_iter(plist) {
        let mut device = None;
        let mut mountpoint = None;
        for pair in key_string_pattern().captures_iter(&dict[1]) {
            match &pair[1] {
                "dev-entry" => device = Some(pair[2].trim().to_string()),
                "mount-point" => mountpoint = Some(pair[2].trim().to_string()),
                _ => {}
            }
        }
        if let (Some(device), Some(mountpoint)) = (device, mountpoint) {
            return Ok(AttachedVolume {
                device,
                mountpoint: PathBuf::from(mountpoint),
            });
        }
    }
    Err(ImageError::ParseAttach {
        output: plist.trim().to_string(),
    })
}
