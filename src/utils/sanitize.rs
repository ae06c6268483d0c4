//! File-name sanitisation for names announced by a remote peer.

/// Reduce a (possibly adversarial) announced name to a single safe path
/// component.
///
/// Directory parts are dropped, including `.` and `..`; only alphanumerics
/// plus `.`, `-`, `_` and space survive. Falls back to `"file"`.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .next_back()
        .unwrap_or("");

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_matches(|c| c == '.' || c == ' ');

    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}
