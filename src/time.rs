// SPDX-FileCopyrightText: 2025 Grove contributors
// SPDX-License-Identifier: MIT

//! UTC timestamp formatting for persisted records.
//!
//! Records carry RFC 3339 timestamps with second precision, written in
//! UTC with a `Z` suffix.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time as an RFC 3339 UTC string, e.g. `2025-06-01T12:30:00Z`.
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Format seconds since the Unix epoch as RFC 3339 UTC.
pub fn format_epoch(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Parse an RFC 3339 timestamp back to epoch seconds.
///
/// Explicit offsets are normalized to UTC; anything before the epoch
/// or not RFC 3339 at all reads as `None`.
pub fn epoch_from_utc(value: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(value).ok()?;
    u64::try_from(parsed.timestamp()).ok()
}

/// Seconds elapsed since `timestamp`, or `None` if it does not parse
/// or lies in the future.
pub fn age_seconds(timestamp: &str) -> Option<u64> {
    let then = epoch_from_utc(timestamp)?;
    let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
    now.checked_sub(then)
}
