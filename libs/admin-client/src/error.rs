use thiserror::Error;

/// Coarse classification of a non-2xx admin API response, mirroring the distinctions the
/// reconciler actually branches on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusClass {
    NotFound,
    MethodNotAllowed,
    Other,
}

impl StatusClass {
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        match status {
            reqwest::StatusCode::NOT_FOUND => StatusClass::NotFound,
            reqwest::StatusCode::METHOD_NOT_ALLOWED => StatusClass::MethodNotAllowed,
            _ => StatusClass::Other,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("request to {0} failed: {1}")]
    Transport(String, #[source] reqwest::Error),

    #[error("{operation} against {url} returned {status}: {message}")]
    Api {
        operation: &'static str,
        url: String,
        status: reqwest::StatusCode,
        class: StatusClass,
        message: String,
    },

    #[error("failed to decode response body from {0}: {1}")]
    Decode(String, #[source] reqwest::Error),

    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid admin endpoint: {0}")]
    InvalidEndpoint(#[source] url::ParseError),
}

impl Error {
    /// The status class of an [`Error::Api`], if this error came from a classified response.
    pub fn status_class(&self) -> Option<StatusClass> {
        match self {
            Error::Api { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Whether this failure is worth retrying: connection-level and 5xx failures are, explicit
    /// 4xx classifications are not (the caller already knows what a repeat would answer).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(..) => true,
            Error::Api { status, .. } => status.is_server_error(),
            Error::Decode(..) | Error::Encode(..) | Error::InvalidEndpoint(..) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
