//! The namespaced user-property table from spec.md §3, as a closed enum
//! instead of string literals scattered through the codebase -- mirrors the
//! teacher's single `PROPERTY_SNAPKEEP` constant in `tomato.rs`, generalized
//! to the full property table this system needs.

use std::fmt;

/// One of the nine user properties this crate reads or writes. Kept as an
/// enum rather than `&'static str` so a typo in a property name is a
/// compile error, not a silent no-op against an unmatched ZFS property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyName {
    IntervalMinutes,
    CreatedAt,
    SendTo,
    Sending,
    SentAt,
    RetentionCount,
    RetentionMinutes,
    DeleteAt,
    DeleteWithoutSnapshots,
    ReceiveResumeToken,
}

impl PropertyName {
    const fn key(self) -> &'static str {
        match self {
            PropertyName::IntervalMinutes => "interval-minutes",
            PropertyName::CreatedAt => "created-at",
            PropertyName::SendTo => "send-to",
            PropertyName::Sending => "sending",
            PropertyName::SentAt => "sent-at",
            PropertyName::RetentionCount => "retention-count",
            PropertyName::RetentionMinutes => "retention-minutes",
            PropertyName::DeleteAt => "delete-at",
            PropertyName::DeleteWithoutSnapshots => "delete-without-snapshots",
            PropertyName::ReceiveResumeToken => "receive_resume_token",
        }
    }

    /// The fully-qualified `namespace:name` ZFS property, ready to pass to
    /// `zfs get`/`zfs set`.
    pub fn qualified(self, namespace: &str) -> String {
        format!("{namespace}:{}", self.key())
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_under_namespace() {
        assert_eq!(
            PropertyName::SendTo.qualified("zrepd"),
            "zrepd:send-to"
        );
    }

    #[test]
    fn display_matches_bare_key() {
        assert_eq!(PropertyName::DeleteAt.to_string(), "delete-at");
    }
}
