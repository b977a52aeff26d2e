//! Authentication middleware (spec.md §4.6, §6): matches
//! `X-Authentication-Token` against a configured allow-list. 401 on
//! missing or mismatched token.
//!
//! Deliberately simpler than `clockworklabs-SpacetimeDB`'s JWT-claims-based
//! `auth.rs` (`SpacetimeAuth`/`SpacetimeCreds`) -- spec.md §6 specifies a
//! flat token list, not identity/claims, so a single string comparison is
//! the whole job. Factored as one `axum::middleware::from_fn_with_state`
//! layer so a deployment that wants real identity can swap its own
//! `tower::Layer` in instead.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::error::Error;
use crate::transport::AppState;

fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers.get("X-Authentication-Token")?.to_str().ok()
}

pub async fn require_token<W: crate::zfs::ZfsWrapper + 'static>(
    State(state): State<Arc<AppState<W>>>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    if state.config.authentication_tokens.is_empty() {
        // No tokens configured: auth is off, matching a dev/loopback
        // deployment rather than failing closed on an empty list.
        return Ok(next.run(request).await);
    }

    let provided = token_from_headers(request.headers()).ok_or(Error::Unauthorized)?;
    if state
        .config
        .authentication_tokens
        .iter()
        .any(|t| t == provided)
    {
        Ok(next.run(request).await)
    } else {
        Err(Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Authentication-Token", "secret".parse().unwrap());
        assert_eq!(token_from_headers(&headers), Some("secret"));
    }

    #[test]
    fn missing_header_is_none() {
        assert_eq!(token_from_headers(&HeaderMap::new()), None);
    }
}
