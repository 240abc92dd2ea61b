//! Subject token matching.
//!
//! Subjects are dot-separated token strings. Patterns may use `*` to match
//! exactly one token and `>` to match one or more trailing tokens; `>` is
//! only meaningful as the final token of a pattern.

/// Returns true when `pattern` matches the literal `subject`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            // pattern exhausted before subject, or vice versa
            (None, Some(_)) | (Some(_), None) => return false,
        }
    }
}

/// Validates a literal (non-pattern) subject: non-empty tokens, no wildcards.
pub fn valid_literal(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(subject_matches("function.invoke", "function.invoke"));
        assert!(!subject_matches("function.invoke", "function.list"));
        assert!(!subject_matches("function.invoke", "function.invoke.extra"));
        assert!(!subject_matches("function.invoke.extra", "function.invoke"));
    }

    #[test]
    fn test_single_token_wildcard() {
        assert!(subject_matches("event.*.Order.created", "event.prod.Order.created"));
        assert!(!subject_matches("event.*.Order.created", "event.prod.User.created"));
        assert!(!subject_matches("event.*", "event.a.b"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(subject_matches("event.>", "event.prod.Order.created"));
        assert!(subject_matches("event.>", "event.prod"));
        assert!(!subject_matches("event.>", "event"));
        assert!(!subject_matches("event.>", "metrics.prod"));
    }

    #[test]
    fn test_valid_literal() {
        assert!(valid_literal("event.prod.Order.created"));
        assert!(!valid_literal("event..created"));
        assert!(!valid_literal("event.*"));
        assert!(!valid_literal(""));
    }
}
