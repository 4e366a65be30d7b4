//! Gate verdicts from validator / reviewer output.

const APPROVE: [&str; 2] = ["approved", "passed"];
const REJECT: [&str; 2] = ["needs_revision", "failed"];

/// Decide whether gate output approves.
///
/// A quoted `"verdict"` key with a quoted token is checked first, then bare
/// keywords. Output with no signal at all passes.
pub fn check_verdict(output: &str) -> bool {
    let lower = output.to_lowercase();
    let quoted = |word: &str| lower.contains(&format!("\"{word}\""));

    if lower.contains("\"verdict\"") {
        if APPROVE.iter().any(|w| quoted(w)) {
            return true;
        }
        if REJECT.iter().any(|w| quoted(w)) {
            return false;
        }
    }

    if APPROVE.iter().any(|w| lower.contains(w)) {
        return true;
    }
    if REJECT.iter().any(|w| lower.contains(w)) {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_output_passes() {
        assert!(check_verdict("Looks reasonable overall."));
        assert!(check_verdict(""));
    }

    #[test]
    fn structured_verdicts() {
        assert!(check_verdict(r#"{"verdict": "APPROVED"}"#));
        assert!(check_verdict(r#"{"verdict":"passed","notes":"ok"}"#));
        assert!(!check_verdict(r#"{"verdict":"needs_revision"}"#));
        assert!(!check_verdict(r#"{"verdict": "failed", "issues": ["x"]}"#));
    }

    #[test]
    fn structured_approval_wins_over_stray_words() {
        assert!(check_verdict(
            r#"{"verdict": "approved", "note": "earlier draft failed lint"}"#
        ));
    }

    #[test]
    fn bare_keywords() {
        assert!(check_verdict("All checks passed."));
        assert!(!check_verdict("This NEEDS_REVISION before merge"));
        assert!(!check_verdict("Two tests failed."));
    }
}
