//! Query time-window derivation from classification hints.

use chrono::{DateTime, Duration, Utc};

use crate::triage::TimeWindowHint;

/// Concrete window downstream tools query against. Total: derivation never
/// fails, because every tool requires a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reason: &'static str,
}

fn parse_hint(s: &Option<String>) -> Option<DateTime<Utc>> {
    let s = s.as_deref()?.trim();
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Turn a classification's (possibly partial, possibly absent) time hints
/// into a concrete window anchored at `anchor`.
///
/// A single present edge infers the other at two hours distance; nothing
/// usable falls back to the last 24 hours before the anchor.
pub fn derive_query_window(hint: Option<&TimeWindowHint>, anchor: DateTime<Utc>) -> QueryWindow {
    let (start, end) = match hint {
        Some(hint) => (parse_hint(&hint.start), parse_hint(&hint.end)),
        None => (None, None),
    };
    match (start, end) {
        (Some(start), Some(end)) => QueryWindow {
            start,
            end,
            reason: "explicit",
        },
        (Some(start), None) => QueryWindow {
            start,
            end: start + Duration::hours(2),
            reason: "inferred_end",
        },
        (None, Some(end)) => QueryWindow {
            start: end - Duration::hours(2),
            end,
            reason: "inferred_start",
        },
        (None, None) => QueryWindow {
            start: anchor - Duration::hours(24),
            end: anchor,
            reason: "fallback_last24h",
        },
    }
}
