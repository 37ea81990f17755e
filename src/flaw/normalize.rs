//! Error message normalization.
//!
//! Strips incidental detail (paths, line numbers, identifiers, timestamps,
//! stack-trace frames) so that two reports of the same failure compare equal.

use std::sync::OnceLock;

use regex::Regex;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("Invalid normalization regex"))
}

/// Normalize an error message for similarity comparison.
pub fn normalize_message(message: &str) -> String {
    let mut normalized = message.to_lowercase();

    // Stack-trace boilerplate, one placeholder per frame/header line
    static TRACE_REGEX: OnceLock<Regex> = OnceLock::new();
    let trace_re = regex(
        &TRACE_REGEX,
        concat!(
            r#"(?m)^\s*(?:traceback \(most recent call last\):|stack backtrace:"#,
            // java `at pkg.cls.method(file.java:42)`, js `at fn (/app/x.js:10:5)` or `at /app/x.js:10:5`
            r#"|at\s+(?:(?:async|new)\s+)?(?:[\w$./<>\[\]-]+\s*\([^)\n]*(?::\d+|native method|unknown source|native)\)|\S+:\d+:\d+).*"#,
            r#"|file "[^"]*", line \d+.*|note: run with `rust_backtrace=.*|\d+:\s+0x[0-9a-f]+.*)$"#,
        ),
    );
    normalized = trace_re.replace_all(&normalized, "<trace>").to_string();

    static TIMESTAMP_REGEX: OnceLock<Regex> = OnceLock::new();
    let ts_re = regex(
        &TIMESTAMP_REGEX,
        r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:z|[+-]\d{2}:?\d{2})?",
    );
    normalized = ts_re.replace_all(&normalized, "<ts>").to_string();

    static UUID_REGEX: OnceLock<Regex> = OnceLock::new();
    let uuid_re = regex(
        &UUID_REGEX,
        r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
    );
    normalized = uuid_re.replace_all(&normalized, "<uuid>").to_string();

    // Run identifiers such as `run-1712345678-4242` or `run_20240101_ab12`
    static RUN_ID_REGEX: OnceLock<Regex> = OnceLock::new();
    let run_re = regex(&RUN_ID_REGEX, r"\brun[-_][a-z0-9_-]*\d[a-z0-9_-]*");
    normalized = run_re.replace_all(&normalized, "<run_id>").to_string();

    // Anything with at least one separator is a path
    static PATH_REGEX: OnceLock<Regex> = OnceLock::new();
    let path_re = regex(&PATH_REGEX, r"(?:[a-z]:)?(?:[\w.~-]*[/\\])+[\w.-]+");
    normalized = path_re.replace_all(&normalized, "<path>").to_string();

    static LINE_REGEX: OnceLock<Regex> = OnceLock::new();
    let line_re = regex(&LINE_REGEX, r"\bline \d+|:\d+(?::\d+)?\b");
    normalized = line_re
        .replace_all(&normalized, |caps: &regex::Captures<'_>| {
            if caps[0].starts_with(':') {
                ":<n>".to_string()
            } else {
                "line <n>".to_string()
            }
        })
        .to_string();

    static HEX_REGEX: OnceLock<Regex> = OnceLock::new();
    let hex_re = regex(&HEX_REGEX, r"\b0x[0-9a-f]+\b");
    normalized = hex_re.replace_all(&normalized, "<addr>").to_string();

    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases_and_collapses_whitespace() {
        assert_eq!(
            normalize_message("  Type   Error:\n\tExpected   STRING "),
            "type error: expected string"
        );
    }

    #[test]
    fn test_replaces_paths_and_line_numbers() {
        assert_eq!(
            normalize_message("panicked at src/parser/mod.rs:42:7"),
            "panicked at <path>:<n>"
        );
        assert_eq!(
            normalize_message("error in /home/ci/work/app.py line 88"),
            "error in <path> line <n>"
        );
    }

    #[test]
    fn test_replaces_uuids_and_run_ids() {
        let a = normalize_message("job 550e8400-e29b-41d4-a716-446655440000 failed in run-1712345678-4242");
        let b = normalize_message("job 123e4567-E89B-12d3-a456-426614174000 failed in run-1799999999-17");
        assert_eq!(a, b);
        assert_eq!(a, "job <uuid> failed in <run_id>");
    }

    #[test]
    fn test_replaces_timestamps() {
        assert_eq!(
            normalize_message("[2024-03-01T12:30:45.123Z] connection reset"),
            "[<ts>] connection reset"
        );
    }

    #[test]
    fn test_replaces_trace_lines() {
        let message = "Traceback (most recent call last):\n  File \"x.py\", line 3, in <module>\nValueError: bad";
        assert_eq!(normalize_message(message), "<trace> <trace> valueerror: bad");
    }

    #[test]
    fn test_replaces_java_and_js_frames() {
        let java = "NullPointerException\n\tat com.shop.OrderService.total(OrderService.java:42)\n\tat java.base/java.lang.Thread.run(Native Method)";
        assert_eq!(normalize_message(java), "nullpointerexception <trace> <trace>");

        let js = "TypeError: x is undefined\n    at Object.<anonymous> (/app/src/index.js:10:5)\n    at async main (/app/src/main.js:3:1)\n    at /app/node_modules/lib.js:7:12";
        assert_eq!(
            normalize_message(js),
            "typeerror: x is undefined <trace> <trace> <trace>"
        );
    }

    #[test]
    fn test_prose_starting_with_at_is_kept() {
        assert_eq!(
            normalize_message("At least one deliverable is missing from the phase output"),
            "at least one deliverable is missing from the phase output"
        );
        assert_eq!(
            normalize_message("build failed\nat runtime the service returned http 503"),
            "build failed at runtime the service returned http 503"
        );
    }

    #[test]
    fn test_plain_words_untouched() {
        assert_eq!(
            normalize_message("assertion failed: left == right"),
            "assertion failed: left == right"
        );
    }
}
