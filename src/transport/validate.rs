//! Identifier validation (spec.md §4.6): filesystem/snapshot path segments
//! and resume tokens are checked against a fixed pattern before any ZFS
//! call is made, so a malformed path segment never reaches a shell-out.
//!
//! Grounded on `DanielArmengod-zfs-rs`'s dataset-name character validation
//! in `dataset.rs`, generalized from manual char-scanning to `regex`
//! (already in the pack's dependency families) since spec.md gives exact
//! patterns rather than a hand-rolled grammar.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{2,100}$").expect("valid regex"))
}

fn resume_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{100,500}$").expect("valid regex"))
}

/// Validates one filesystem or snapshot path segment.
pub fn validate_identifier(segment: &str) -> Result<()> {
    if identifier_pattern().is_match(segment) {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(segment.to_string()))
    }
}

pub fn validate_resume_token(token: &str) -> Result<()> {
    if resume_token_pattern().is_match(token) {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_identifier("tank_data01").is_ok());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(validate_identifier("../etc").is_err());
        assert!(validate_identifier("a/b").is_err());
    }

    #[test]
    fn rejects_too_short() {
        assert!(validate_identifier("a").is_err());
    }

    #[test]
    fn resume_token_requires_length() {
        assert!(validate_resume_token(&"a".repeat(100)).is_ok());
        assert!(validate_resume_token(&"a".repeat(99)).is_err());
    }
}
