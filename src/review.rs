//! Review artifact verdict parsing.
//!
//! The reviewer commits `review-details.md` on its lane branch. The first line
//! starting with `Verdict:` decides whether the committer is launched. Anything
//! that is not an explicit approval counts as needs-work.

use std::fmt;

use regex::Regex;
use std::sync::LazyLock;

pub const REVIEW_ARTIFACT: &str = "review-details.md";

static VERDICT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[*_#>-]+\s*)*verdict\s*[*_]*\s*:\s*[*_`]*\s*([a-z-]+)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    NeedsWork,
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewVerdict::Approved => write!(f, "approved"),
            ReviewVerdict::NeedsWork => write!(f, "needs-work"),
        }
    }
}

/// Parse the verdict from artifact content.
///
/// Returns `(verdict, explicit)`; `explicit` is false when no recognised
/// verdict line was found and the fail-closed default was applied.
pub fn parse_verdict(content: &str) -> (ReviewVerdict, bool) {
    for line in content.lines() {
        if let Some(caps) = VERDICT_LINE.captures(line) {
            let word = caps[1].to_ascii_lowercase();
            return match word.as_str() {
                "approved" | "approve" => (ReviewVerdict::Approved, true),
                "needs-work" | "needswork" => (ReviewVerdict::NeedsWork, true),
                _ => (ReviewVerdict::NeedsWork, false),
            };
        }
    }
    (ReviewVerdict::NeedsWork, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_verdicts() {
        assert_eq!(
            parse_verdict("Verdict: approved\n"),
            (ReviewVerdict::Approved, true)
        );
        assert_eq!(
            parse_verdict("# Review\n\nVerdict: needs-work\nfix tests\n"),
            (ReviewVerdict::NeedsWork, true)
        );
    }

    #[test]
    fn test_markdown_decorated_verdict() {
        assert_eq!(
            parse_verdict("**Verdict:** Approved"),
            (ReviewVerdict::Approved, true)
        );
        assert_eq!(
            parse_verdict("- verdict: `needs-work`"),
            (ReviewVerdict::NeedsWork, true)
        );
        assert_eq!(
            parse_verdict("## Verdict: APPROVED"),
            (ReviewVerdict::Approved, true)
        );
    }

    #[test]
    fn test_first_verdict_line_wins() {
        let content = "Verdict: needs-work\n\nVerdict: approved\n";
        assert_eq!(parse_verdict(content).0, ReviewVerdict::NeedsWork);
    }

    #[test]
    fn test_missing_or_unknown_verdict_fails_closed() {
        assert_eq!(
            parse_verdict("Looks great to me!"),
            (ReviewVerdict::NeedsWork, false)
        );
        assert_eq!(
            parse_verdict("Verdict: maybe"),
            (ReviewVerdict::NeedsWork, false)
        );
        assert_eq!(parse_verdict(""), (ReviewVerdict::NeedsWork, false));
    }

    #[test]
    fn test_verdict_must_start_the_line() {
        assert_eq!(
            parse_verdict("The verdict: approved is what I'd say").1,
            false
        );
    }
}
