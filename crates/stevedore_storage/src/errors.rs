use stevedore_core::Digest;

pub type Result<T> = std::result::Result<T, Error>;

/// Storage-layer error kinds.
///
/// The driver variants (`PathNotFound`, `InvalidPath`, `InvalidOffset`,
/// `UnsupportedMethod`, `PartialTransfer`) are part of the driver contract:
/// callers match on them, so driver implementations must preserve the kind
/// rather than flattening into a generic error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("path not found: {path}")]
    PathNotFound { path: String },
    #[error("invalid path: {path}")]
    InvalidPath { path: String },
    #[error("invalid offset {offset} for path: {path}")]
    InvalidOffset { path: String, offset: u64 },
    #[error("storage driver does not support the requested method")]
    UnsupportedMethod,
    #[error("partial transfer from {from_path} to {dest}")]
    PartialTransfer { from_path: String, dest: String },

    #[error("driver error: {0}")]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    #[error("upload is no longer writable")]
    UploadTerminated,
    #[error("upload digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("malformed link file at {path}")]
    MalformedLink { path: String },

    #[error(transparent)]
    Core(#[from] stevedore_core::Error),

    #[error("{0}")]
    TokioJoin(#[from] tokio::task::JoinError),

    #[error("http error: {0}")]
    Http(#[from] http::Error),
}

impl Error {
    /// True when the error means "the object is absent", as opposed to a
    /// failure talking to the backend.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PathNotFound { .. })
    }
}
