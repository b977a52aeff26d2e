//! Typed `X-Receive-Resume-Token` header (spec.md §6 "Headers"), so the
//! resume-token query/response path can be an `axum_extra::TypedHeader`
//! extractor/response part instead of raw `HeaderMap` string fishing.
//!
//! Grounded on the `headers`/`axum-extra` typed-header pairing the pack's
//! axum-based stack (`clockworklabs-SpacetimeDB`) already depends on for
//! its own custom headers.

use std::sync::OnceLock;

use headers::{Error, Header, HeaderName, HeaderValue};

fn resume_token_name() -> &'static HeaderName {
    static NAME: OnceLock<HeaderName> = OnceLock::new();
    NAME.get_or_init(|| HeaderName::from_static("x-receive-resume-token"))
}

/// The opaque ZFS resume token, carried in both directions per spec.md §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResumeToken(pub String);

impl Header for ReceiveResumeToken {
    fn name() -> &'static HeaderName {
        resume_token_name()
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(Error::invalid)?;
        let token = value.to_str().map_err(|_| Error::invalid())?;
        Ok(ReceiveResumeToken(token.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_round_trip() {
        let header = ReceiveResumeToken("1-abc123".to_string());
        let mut values = Vec::new();
        header.encode(&mut values);
        let decoded = ReceiveResumeToken::decode(&mut values.iter()).unwrap();
        assert_eq!(decoded, header);
    }
}
