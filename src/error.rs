use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors raised anywhere in the core: by the ZFS wrapper, the replication
/// engine, or the HTTP transport. Each variant carries enough context for
/// both the dispatcher loops (log-and-continue vs. stop-the-run) and the
/// HTTP boundary (status code mapping, spec.md §6/§7) to do the right thing.
#[derive(Error, Debug)]
pub enum Error {
    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("dataset already exists: {0}")]
    DatasetExists(String),

    /// A partial receive left resumable state on the server; `token` is the
    /// opaque blob ZFS reported on stderr.
    #[error("receive is resumable, token present")]
    ResumableStream { token: String },

    #[error("too many concurrent requests")]
    TooManyRequests,

    #[error("run was cancelled")]
    ContextCancelled,

    #[error("zfs command failed: {command}: {stderr}")]
    Command { command: String, stderr: String },

    #[error("no snapshots in common with remote")]
    NoCommonSnapshots,

    #[error("dataset has no local snapshots")]
    NoLocalSnapshots,

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("resume token mismatch")]
    ResumeTokenMismatch,

    #[error("no resumable receive state on server")]
    ResumeStateAbsent,

    #[error("authentication token missing or invalid")]
    Unauthorized,

    #[error("destroy forbidden by server policy")]
    DestroyForbidden,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Per spec.md §7: only cancellation stops a dispatcher loop. Everything
    /// else is logged and the loop moves on to the next dataset.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Error::ContextCancelled)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::DatasetNotFound(_) => StatusCode::NOT_FOUND,
            Error::DatasetExists(_) => StatusCode::CONFLICT,
            Error::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            Error::ResumeTokenMismatch => StatusCode::CONFLICT,
            Error::ResumeStateAbsent => StatusCode::PRECONDITION_FAILED,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::DestroyForbidden => StatusCode::FORBIDDEN,
            Error::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Error::ContextCancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
