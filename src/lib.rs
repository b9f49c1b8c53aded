// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Ephemeral copy-on-write workspaces for git projects.
//!
//! Grove manages short-lived clones of a __golden copy__: a normal git
//! checkout that stays pristine while experiments happen in cheap
//! workspaces next to it. Two backends produce those workspaces. The
//! tree backend makes a direct copy-on-write clone of the project
//! directory, skipping configured excludes. The image backend keeps the
//! project synced into a shared sparse disk image and mounts it once
//! per workspace behind a private shadow overlay, so even gigantic
//! build caches clone in constant time.
//!
//! All persistent state lives under `.grove/` in the golden copy:
//! configuration, the active backend, image metadata, and hooks. Each
//! workspace carries a marker file identifying its origin.

pub mod backend;
pub mod clone;
pub mod config;
pub mod hooks;
pub mod image;
pub mod lifecycle;
pub mod progress;
pub mod runner;
pub mod store;
pub mod time;
pub mod vcs;
pub mod workspace;

pub use backend::Backend;
pub use config::{BackendKind, Config};
pub use lifecycle::Project;
pub use runner::{ExecRunner, Runner};
pub use workspace::Info;
