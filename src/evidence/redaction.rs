//! Redaction of operator/customer-sensitive fragments from free text.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of any redacted detail placed into a summary.
pub const MAX_DETAIL_LEN: usize = 200;

static AUTH_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Authorization:\s*\S+").expect("static regex"));
static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Bearer\s+\S+").expect("static regex"));
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex")
});
static INTERNAL_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[\w.-]+\.(internal|corp|svc|local)\b").expect("static regex")
});
static REQUEST_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(x-request-id|request id|reqid|trace-id)\s*[:=]\s*[A-Za-z0-9-]{6,128}")
        .expect("static regex")
});

/// Strip credentials, e-mail addresses, internal hostnames, and request ids
/// from a text fragment.
pub fn redact(text: &str) -> String {
    let text = AUTH_HEADER_RE.replace_all(text, "[REDACTED]");
    let text = BEARER_RE.replace_all(&text, "[REDACTED]");
    let text = EMAIL_RE.replace_all(&text, "[REDACTED]");
    let text = INTERNAL_HOST_RE.replace_all(&text, "[REDACTED]");
    let text = REQUEST_ID_RE.replace_all(&text, "[REDACTED]");
    text.into_owned()
}

/// Redact and cap a detail fragment for inclusion in a summary.
pub fn redact_detail(text: &str) -> String {
    let clean = redact(text);
    clean.chars().take(MAX_DETAIL_LEN).collect()
}
