//! External filename derivation
//!
//! Source titles routinely contain scripts and symbols the upload sink will not
//! accept. [`sanitize_filename`] maps any title to a name drawn only from
//! `[A-Za-z0-9._-]`:
//!
//! 1. transliterate to ASCII (`Привет мир` → `Privet mir`)
//! 2. replace every run of other characters (and underscores) with one `_`
//! 3. trim leading and trailing `_`
//! 4. fall back to a timestamp-derived name when nothing usable is left
//!
//! Two titles may sanitize to the same name; collisions are not resolved here.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Character substituted for anything outside the permitted set
pub const PLACEHOLDER: char = '_';

/// Longest name produced, in bytes (all output is ASCII)
pub const MAX_FILENAME_LEN: usize = 200;

#[allow(clippy::expect_used)]
static DISALLOWED_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9.\-]+").expect("static pattern is valid"));

/// Whether `c` may appear in a sanitized filename
pub fn is_permitted(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | PLACEHOLDER)
}

/// Derive a sink-safe filename from an arbitrary title
pub fn sanitize_filename(raw: &str) -> String {
    sanitize_filename_at(raw, Utc::now())
}

/// Same as [`sanitize_filename`] with an explicit clock for the fallback name
pub fn sanitize_filename_at(raw: &str, now: DateTime<Utc>) -> String {
    let Some(name) = sanitize_component(raw) else {
        return fallback_name(now);
    };

    // Nothing left before the extension (".zip") would produce a hidden file
    if name.starts_with('.') {
        let ext = name.trim_start_matches('.');
        return format!("{}.{}", fallback_name(now), ext);
    }

    name
}

/// Steps 1-3 only: `None` when nothing but dots and placeholders remain.
///
/// Deterministic, so it is also used to name local copies.
pub fn sanitize_component(raw: &str) -> Option<String> {
    let ascii = deunicode::deunicode(raw);
    let replaced = DISALLOWED_RUN.replace_all(&ascii, "_");
    let trimmed = replaced.trim_matches(PLACEHOLDER);
    let name = truncate_preserving_extension(trimmed, MAX_FILENAME_LEN);

    if name.chars().all(|c| c == '.' || c == PLACEHOLDER) {
        None
    } else {
        Some(name)
    }
}

fn fallback_name(now: DateTime<Utc>) -> String {
    format!("artifact_{}", now.format("%Y%m%d_%H%M%S_%3f"))
}

fn truncate_preserving_extension(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }

    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 && name.len() - idx <= 16 => name.split_at(idx),
        _ => (name, ""),
    };
    let keep = max_len.saturating_sub(ext.len());
    let stem = stem[..keep.min(stem.len())].trim_end_matches(PLACEHOLDER);
    format!("{stem}{ext}")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    fn assert_permitted(name: &str) {
        assert!(!name.is_empty(), "name must not be empty");
        assert!(
            name.chars().all(is_permitted),
            "{name:?} contains characters outside the permitted set"
        );
        assert!(!name.starts_with(PLACEHOLDER) && !name.ends_with(PLACEHOLDER));
        assert!(!name.contains("__"), "{name:?} has repeated placeholders");
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(sanitize_filename("report-2024.pdf"), "report-2024.pdf");
    }

    #[test]
    fn cyrillic_is_transliterated() {
        let name = sanitize_filename("Привет мир.zip");
        assert_eq!(name, "Privet_mir.zip");
        assert_permitted(&name);
    }

    #[test]
    fn mixed_scripts_and_symbols_yield_permitted_name() {
        for title in [
            "日本語のタイトル: 第1巻 (完全版)!!.rar",
            "Ελληνικά / ñandú & café?.7z",
            "  <<weird>> name | with * stars  ",
            "tabs\tand\nnewlines",
        ] {
            assert_permitted(&sanitize_filename(title));
        }
    }

    #[test]
    fn placeholder_runs_collapse_and_trim() {
        assert_eq!(sanitize_filename("__a  ?? b__"), "a_b");
        assert_eq!(sanitize_filename("a_ _b"), "a_b");
        assert_eq!(sanitize_filename("///x///"), "x");
    }

    #[test]
    fn empty_result_falls_back_to_timestamp() {
        let now = fixed_now();
        assert_eq!(sanitize_filename_at("", now), "artifact_20240309_140507_000");
        assert_eq!(sanitize_filename_at("?!*<>|", now), "artifact_20240309_140507_000");
        assert_eq!(sanitize_filename_at("...", now), "artifact_20240309_140507_000");
    }

    #[test]
    fn extension_survives_when_stem_is_unusable() {
        let name = sanitize_filename_at("???.zip", fixed_now());
        assert_eq!(name, "artifact_20240309_140507_000.zip");
    }

    #[test]
    fn component_is_none_when_nothing_usable_remains() {
        assert_eq!(sanitize_component("%%%"), None);
        assert_eq!(sanitize_component("Привет"), Some("Privet".to_string()));
    }

    #[test]
    fn long_names_are_truncated_keeping_extension() {
        let title = format!("{}.mkv", "a".repeat(500));
        let name = sanitize_filename(&title);
        assert!(name.len() <= MAX_FILENAME_LEN);
        assert!(name.ends_with(".mkv"));
        assert_permitted(&name);
    }
}
