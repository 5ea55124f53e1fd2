//! Failure classification over captured executor output.
//!
//! Categories are tried in priority order; the first category with a
//! pattern hit wins: test_failure > compile_error > permission_denied >
//! rate_limited > timeout > unknown.

use cx_core::types::FailureCategory;

/// Lowercase substring patterns per category, in priority order.
const PATTERN_SETS: &[(FailureCategory, &[&str])] = &[
    (
        FailureCategory::TestFailure,
        &[
            "test failed",
            "tests failed",
            "failures:",
            "assertion failed",
            "panicked at",
            "expect(received)",
        ],
    ),
    (
        FailureCategory::CompileError,
        &[
            "error[e",
            "compilation failed",
            "cannot find",
            "undefined reference",
            "syntaxerror",
            "type error",
        ],
    ),
    (
        FailureCategory::PermissionDenied,
        &[
            "permission denied",
            "eacces",
            "operation not permitted",
            "401 unauthorized",
            "403 forbidden",
        ],
    ),
    (
        FailureCategory::RateLimited,
        &[
            "rate limit",
            "rate-limited",
            "429",
            "too many requests",
            "quota exceeded",
            "overloaded",
        ],
    ),
    (
        FailureCategory::Timeout,
        &["timed out", "timeout", "deadline exceeded", "etimedout"],
    ),
];

/// Classify output into the highest-priority matching category.
pub fn classify(output: &str) -> FailureCategory {
    let haystack = output.to_lowercase();
    for (category, patterns) in PATTERN_SETS {
        if patterns.iter().any(|p| haystack.contains(p)) {
            return *category;
        }
    }
    FailureCategory::Unknown
}

/// A one-line human summary: the first line that triggered the category,
/// falling back to the last non-empty line of output.
pub fn summarize(output: &str, category: FailureCategory) -> String {
    let patterns: &[&str] = PATTERN_SETS
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, p)| *p)
        .unwrap_or(&[]);

    let matched = output.lines().find(|line| {
        let lower = line.to_lowercase();
        patterns.iter().any(|p| lower.contains(p))
    });
    let line = matched
        .or_else(|| output.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("")
        .trim();

    truncate(line, 200)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_beats_everything() {
        let output = "building...\nerror[E0308]: mismatched types\ntest failed: 3 failures\nrate limit hit";
        assert_eq!(classify(output), FailureCategory::TestFailure);
    }

    #[test]
    fn compile_error_beats_rate_limit() {
        let output = "error[E0433]: failed to resolve\n429 too many requests";
        assert_eq!(classify(output), FailureCategory::CompileError);
    }

    #[test]
    fn permission_before_timeout() {
        let output = "request timed out\npermission denied (publickey)";
        assert_eq!(classify(output), FailureCategory::PermissionDenied);
    }

    #[test]
    fn unknown_when_nothing_matches() {
        assert_eq!(classify("everything is fine"), FailureCategory::Unknown);
        assert_eq!(classify(""), FailureCategory::Unknown);
    }

    #[test]
    fn summary_picks_matching_line() {
        let output = "step 1 ok\nassertion failed: left == right\nstep 3";
        let summary = summarize(output, FailureCategory::TestFailure);
        assert_eq!(summary, "assertion failed: left == right");
    }

    #[test]
    fn summary_falls_back_to_last_line() {
        let output = "first\n\nsomething odd happened\n\n";
        let summary = summarize(output, FailureCategory::Unknown);
        assert_eq!(summary, "something odd happened");
    }

    #[test]
    fn summary_truncates_long_lines() {
        let long = "x".repeat(500);
        let summary = summarize(&long, FailureCategory::Unknown);
        assert!(summary.len() <= 204);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn case_insensitive_matching() {
        assert_eq!(classify("RATE LIMIT exceeded"), FailureCategory::RateLimited);
        assert_eq!(classify("Timed Out waiting"), FailureCategory::Timeout);
    }
}
