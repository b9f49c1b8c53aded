// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! Progress model for long-running commands.
//!
//! The lifecycle reports phases on a single 0..=100 scale with fixed
//! bands: preflight ends at 5, the clone owns 5 to 95, the post-clone
//! hook 95 to 99, and branch checkout plus completion fill the rest.
//! The reported percentage never decreases, whatever the underlying
//! counters do; a re-scanned clone total shrinking mid-flight shows up
//! as the bar stalling, not rewinding.
//!
//! Rendering is separate from the model. [`PlainLines`] writes
//! throttled `[NN%] phase` lines for non-interactive stderr;
//! [`styled_bar`] builds the interactive bar. Both consume the same
//! updates.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;

/// Sink for lifecycle progress updates: percent and phase label.
pub type PhaseSink<'a> = &'a mut (dyn FnMut(u8, &str) + Send);

/// Percent of the overall scale where the clone starts.
pub const CLONE_START: u8 = 5;
/// Percent of the overall scale where the clone ends.
pub const CLONE_END: u8 = 95;
/// Percent reported while the post-clone hook runs.
pub const HOOK_START: u8 = 95;
/// Percent reported while the branch checkout runs.
pub const CHECKOUT_START: u8 = 99;

/// Maps a counter onto a band of the overall scale, monotonically.
#[derive(Debug)]
pub struct BandedCounter {
    min: u8,
    max: u8,
    percent: u8,
}

impl BandedCounter {
    pub fn new(min: u8, max: u8) -> Self {
        let (min, max) = if max < min { (max, min) } else { (min, max) };
        Self {
            min,
            max,
            percent: min,
        }
    }

    /// Fold a `done`-of-`total` observation in and return the current
    /// band percentage. Observations that would move backwards are
    /// ignored.
    pub fn update(&mut self, done: usize, total: usize) -> u8 {
        if total > 0 {
            let done = done.min(total);
            let span = (self.max - self.min) as usize;
            let next = self.min + ((done * span) / total) as u8;
            if next > self.percent {
                self.percent = next.min(self.max);
            }
        }
        self.percent
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

/// Monotone forwarder in front of an optional sink. Keeps the
/// lifecycle code free of `if let Some` noise and guarantees the
/// percentage never steps backwards.
pub struct Progress<'a, 's> {
    sink: Option<&'a mut PhaseSink<'s>>,
    last: u8,
}

impl<'a, 's> Progress<'a, 's> {
    pub fn new(sink: Option<&'a mut PhaseSink<'s>>) -> Self {
        Self { sink, last: 0 }
    }

    pub fn update(&mut self, percent: u8, phase: &str) {
        let percent = percent.min(100).max(self.last);
        self.last = percent;
        if let Some(sink) = self.sink.as_mut() {
            sink(percent, phase);
        }
    }

    pub fn enabled(&self) -> bool {
        self.sink.is_some()
    }
}

/// Line renderer for non-interactive stderr.
///
/// Emits `[NN%] phase` on phase changes, on advances of at least five
/// points, on the very first update, and at 100; everything else is
/// dropped to keep logs readable.
pub struct PlainLines<W: Write> {
    out: W,
    last_percent: Option<u8>,
    last_phase: String,
}

impl<W: Write> PlainLines<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_percent: None,
            last_phase: String::new(),
        }
    }

    pub fn update(&mut self, percent: u8, phase: &str) {
        let emit = phase != self.last_phase
            || self
                .last_percent
                .is_none_or(|last| percent.saturating_sub(last) >= 5)
            || percent == 100;
        if !emit {
            return;
        }
        self.last_percent = Some(percent);
        self.last_phase = phase.to_string();
        // stderr going away mid-run is not worth failing the create.
        let _ = writeln!(self.out, "[{percent}%] {phase}");
    }
}

/// Interactive progress bar for a terminal stderr.
pub fn styled_bar(command: &'static str) -> Result<ProgressBar, indicatif::style::TemplateError> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {prefix}  [{wide_bar:.yellow/blue}] {pos:>3}%  {msg}",
    )?
    .progress_chars("#>-");
    let bar = ProgressBar::new(100);
    bar.set_style(style);
    bar.set_prefix(command);
    Ok(bar)
}
