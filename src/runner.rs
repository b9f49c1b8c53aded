// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Every external binary grove touches (the CoW clone tool, the disk
//! image tool, the tree synchronizer, git, user hooks) is invoked
//! through the [`Runner`] trait. Nothing else in the crate is allowed
//! to spawn processes, which keeps the rest of the code deterministic
//! under a scripted fake.
//!
//! # Streamed Output
//!
//! [`Runner::stream`] feeds a line callback from both stdout and
//! stderr. Lines are split on carriage return as well as line feed,
//! because progress-printing tools overwrite their output in place
//! with bare `\r` and would otherwise emit one giant "line" at exit.
//! Both streams are drained in parallel; the callback is serialized
//! behind a mutex.

use std::{
    io::Read,
    path::Path,
    process::{Command, Stdio},
    sync::Mutex,
    thread,
};
use tracing::debug;

/// Line callback for [`Runner::stream`].
pub type LineSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Spawn and observe external commands.
pub trait Runner {
    /// Run to completion, returning combined stdout and stderr.
    ///
    /// # Errors
    ///
    /// - Return [`RunnerError::Spawn`] if the binary cannot be started.
    /// - Return [`RunnerError::Failed`] on non-zero exit, carrying the
    ///   combined output for error messages.
    fn output(&self, program: &str, args: &[String]) -> Result<String>;

    /// Run to completion, invoking `on_line` for every output line.
    ///
    /// # Errors
    ///
    /// Same contract as [`Runner::output`]; the combined output is
    /// still collected so failures stay actionable.
    fn stream(&self, program: &str, args: &[String], on_line: LineSink<'_>) -> Result<()>;

    /// Run to completion with inherited stdio, optionally in `cwd`.
    ///
    /// Used for user-facing commands (hooks, warmup) whose output
    /// belongs on the caller's terminal.
    ///
    /// # Errors
    ///
    /// - Return [`RunnerError::Spawn`] if the binary cannot be started.
    /// - Return [`RunnerError::Failed`] on non-zero exit.
    fn interactive(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<()>;
}

/// [`Runner`] backed by real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecRunner;

impl Runner for ExecRunner {
    fn output(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("run: {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RunnerError::Spawn {
                program: program.into(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(String::from_utf8_lossy(&output.stderr).as_ref());

        if !output.status.success() {
            return Err(RunnerError::Failed {
                program: program.into(),
                args: args.join(" "),
                output: combined.trim_end().into(),
            });
        }

        Ok(combined)
    }

    fn stream(&self, program: &str, args: &[String], on_line: LineSink<'_>) -> Result<()> {
        debug!("stream: {program} {}", args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.into(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let sink = Mutex::new(on_line);

        let (out_buf, err_buf) = thread::scope(|scope| {
            let sink = &sink;
            let out = scope.spawn(move || stdout.map(|r| drain(r, sink)).unwrap_or_default());
            let err = scope.spawn(move || stderr.map(|r| drain(r, sink)).unwrap_or_default());
            (
                out.join().unwrap_or_default(),
                err.join().unwrap_or_default(),
            )
        });

        let status = child.wait().map_err(|source| RunnerError::Spawn {
            program: program.into(),
            source,
        })?;
        if !status.success() {
            return Err(RunnerError::Failed {
                program: program.into(),
                args: args.join(" "),
                output: format!("{out_buf}{err_buf}").trim_end().into(),
            });
        }

        Ok(())
    }

    fn interactive(&self, program: &str, args: &[String], cwd: Option<&Path>) -> Result<()> {
        debug!("interactive: {program} {}", args.join(" "));
        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let status = command
            .status()
            .map_err(|source| RunnerError::Spawn {
                program: program.into(),
                source,
            })?;
        if !status.success() {
            return Err(RunnerError::Failed {
                program: program.into(),
                args: args.join(" "),
                output: String::new(),
            });
        }

        Ok(())
    }
}

/// Read `reader` to exhaustion, invoking the sink per CR/LF-split line.
///
/// Returns everything read, for inclusion in failure messages.
fn drain(reader: impl Read, sink: &Mutex<LineSink<'_>>) -> String {
    let mut reader = reader;
    let mut raw = Vec::new();
    let mut partial = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        raw.extend_from_slice(&chunk[..n]);
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                emit(&partial, sink);
                partial.clear();
            } else {
                partial.push(byte);
            }
        }
    }
    emit(&partial, sink);

    String::from_utf8_lossy(&raw).into_owned()
}

fn emit(bytes: &[u8], sink: &Mutex<LineSink<'_>>) {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if let Ok(mut on_line) = sink.lock() {
        (on_line)(line);
    }
}

/// External command failure modes.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Binary could not be spawned at all.
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Binary exited non-zero; `output` holds combined stdout/stderr.
    #[error("{program} {args} failed\n{output}")]
    Failed {
        program: String,
        args: String,
        output: String,
    },
}

impl RunnerError {
    /// Combined output of the failed command, if any was captured.
    pub fn output(&self) -> &str {
        match self {
            Self::Failed { output, .. } => output,
            Self::Spawn { .. } => "",
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = RunnerError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for unit tests.

    use super::{LineSink, Result, RunnerError};
    use std::{cell::RefCell, collections::VecDeque, path::Path};

    /// One recorded invocation: program plus arguments.
    pub type Call = (String, Vec<String>);

    /// Scripted response for one expected invocation.
    pub struct Script {
        /// Lines fed to the stream sink (ignored by `output`).
        pub lines: Vec<String>,
        /// Combined output returned by `output`.
        pub output: String,
        /// Whether the command "exits" zero.
        pub ok: bool,
    }

    impl Script {
        pub fn ok() -> Self {
            Self {
                lines: Vec::new(),
                output: String::new(),
                ok: true,
            }
        }

        pub fn with_output(output: impl Into<String>) -> Self {
            Self {
                output: output.into(),
                ..Self::ok()
            }
        }

        pub fn with_lines(lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
            Self {
                lines: lines.into_iter().map(Into::into).collect(),
                ..Self::ok()
            }
        }

        pub fn fail(output: impl Into<String>) -> Self {
            Self {
                output: output.into(),
                ok: false,
                ..Self::ok()
            }
        }
    }

    /// Replays queued scripts in order and records every call.
    #[derive(Default)]
    pub struct FakeRunner {
        scripts: RefCell<VecDeque<Script>>,
        pub calls: RefCell<Vec<Call>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, script: Script) {
            self.scripts.borrow_mut().push_back(script);
        }

        fn next(&self, program: &str, args: &[String]) -> Script {
            self.calls
                .borrow_mut()
                .push((program.into(), args.to_vec()));
            self.scripts
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(Script::ok)
        }

        fn complete(program: &str, args: &[String], script: Script) -> Result<String> {
            if script.ok {
                Ok(script.output)
            } else {
                Err(RunnerError::Failed {
                    program: program.into(),
                    args: args.join(" "),
                    output: script.output,
                })
            }
        }
    }

    impl super::Runner for FakeRunner {
        fn output(&self, program: &str, args: &[String]) -> Result<String> {
            let script = self.next(program, args);
            Self::complete(program, args, script)
        }

        fn stream(&self, program: &str, args: &[String], on_line: LineSink<'_>) -> Result<()> {
            let script = self.next(program, args);
            for line in &script.lines {
                on_line(line);
            }
            Self::complete(program, args, script).map(|_| ())
        }

        fn interactive(&self, program: &str, args: &[String], _cwd: Option<&Path>) -> Result<()> {
            let script = self.next(program, args);
            Self::complete(program, args, script).map(|_| ())
        }
    }
}
