use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}: {1}")]
    FinalizerError(
        String,
        #[source] Box<kube::runtime::finalizer::Error<Error>>,
    ),

    #[error("admin API error: {0}")]
    AdminClientError(#[source] Box<m3dbop_admin_client::Error>),

    #[error("{0}")]
    Validation(String),

    #[error("refusing unsafe mutation: {0}")]
    Unsafe(String),

    #[error("pod identity not ready: {0}")]
    PodNotReady(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),
}

impl From<m3dbop_admin_client::Error> for Error {
    fn from(e: m3dbop_admin_client::Error) -> Self {
        Error::AdminClientError(Box::new(e))
    }
}

impl From<m3dbop_k8s_util::error::Error> for Error {
    fn from(e: m3dbop_k8s_util::error::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
