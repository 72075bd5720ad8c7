//! Cleanup of daemon-reported build errors.
//!
//! Graph-solver daemons phrase failures in terms of their own internals.
//! The rules below rewrite the known verbose forms into what a user needs
//! to act on. Rules apply in order, each to the output of the previous one.

use once_cell::sync::Lazy;
use regex::Regex;

/// `(pattern, replacement)` pairs, applied top to bottom.
pub const BUILD_ERROR_RULES: &[(&str, &str)] = &[
    // Present on every frontend failure.
    (r"^failed to solve with frontend dockerfile\.v0: failed to build LLB: ", ""),
    // Redundant with "executor failed running". The daemon misspells "successfully".
    (r"(executor failed running.*): runc did not terminate sucessfully", "${1}"),
    // "failed to compute cache key: foo.txt not found: not found"
    (r"failed to compute cache key: (.* not found): not found", "${1}"),
];

static COMPILED_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    BUILD_ERROR_RULES
        .iter()
        .map(|(pattern, replacement)| {
            (Regex::new(pattern).expect("Invalid build error cleanup regex"), *replacement)
        })
        .collect()
});

/// Rewrite a daemon build error for display.
pub fn cleanup_build_error(message: &str) -> String {
    COMPILED_RULES.iter().fold(message.to_string(), |acc, (re, replacement)| {
        re.replace_all(&acc, *replacement).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_compile() {
        assert_eq!(COMPILED_RULES.len(), BUILD_ERROR_RULES.len());
    }

    #[test]
    fn test_strips_frontend_prefix() {
        let msg = "failed to solve with frontend dockerfile.v0: failed to build LLB: something broke";
        assert_eq!(cleanup_build_error(msg), "something broke");
    }

    #[test]
    fn test_prefix_only_stripped_at_start() {
        let msg = "error: failed to solve with frontend dockerfile.v0: failed to build LLB: x";
        assert_eq!(cleanup_build_error(msg), msg);
    }

    #[test]
    fn test_collapses_runc_message() {
        let msg = "failed to solve with frontend dockerfile.v0: failed to build LLB: executor failed running [/bin/sh -c make]: runc did not terminate sucessfully";
        assert_eq!(cleanup_build_error(msg), "executor failed running [/bin/sh -c make]");
    }

    #[test]
    fn test_collapses_cache_key_message() {
        let msg = "failed to compute cache key: foo.txt not found: not found";
        assert_eq!(cleanup_build_error(msg), "foo.txt not found");
    }

    #[test]
    fn test_unrelated_message_untouched() {
        assert_eq!(cleanup_build_error("pull access denied"), "pull access denied");
    }
}
