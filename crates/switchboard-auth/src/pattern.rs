//! Glob matching for API-key agent patterns.

use glob::Pattern;

/// Whether `agent_id` is covered by the key's glob `pattern`.
///
/// Patterns are shell-style globs (`machine/*`, `*/project`, `*`). Agent
/// ids are flat identifiers, not paths, so matching uses the default
/// options where `*` crosses `/`; `*` alone covers every agent. An
/// unparseable pattern never matches.
pub fn pattern_allows(pattern: &str, agent_id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match Pattern::new(pattern) {
        Ok(glob) => glob.matches(agent_id),
        Err(err) => {
            tracing::warn!(pattern, error = %err, "unparseable agent pattern never matches");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        assert!(pattern_allows("*", "lab/worker"));
        assert!(pattern_allows("*", "a/b/c"));
    }

    #[test]
    fn machine_prefix_pattern() {
        assert!(pattern_allows("lab/*", "lab/worker"));
        assert!(pattern_allows("lab/*", "lab/deep/nest"));
        assert!(!pattern_allows("lab/*", "other/worker"));
    }

    #[test]
    fn project_suffix_pattern() {
        assert!(pattern_allows("*/billing", "lab/billing"));
        assert!(pattern_allows("*/billing", "edge/billing"));
        assert!(!pattern_allows("*/billing", "lab/ledger"));
    }

    #[test]
    fn exact_pattern_only_matches_itself() {
        assert!(pattern_allows("lab/worker", "lab/worker"));
        assert!(!pattern_allows("lab/worker", "lab/worker-2"));
    }

    #[test]
    fn invalid_pattern_never_matches() {
        assert!(!pattern_allows("lab/[", "lab/worker"));
    }
}
