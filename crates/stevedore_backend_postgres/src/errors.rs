pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] stevedore_core::Error),

    #[error("storage error: {0}")]
    Storage(#[from] stevedore_storage::Error),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("sqlx migration error: {0}")]
    SqlxMigrate(#[from] sqlx::migrate::MigrateError),
    #[error("sea-query error: {0}")]
    SeaQuery(#[from] sea_query::error::Error),

    #[error("error serializing to value")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    TokioJoin(#[from] tokio::task::JoinError),

    #[error("transaction already rolled back or committed")]
    TxInactive,
    #[error("transaction deadline exceeded")]
    TxDeadlineExceeded,
    #[error("invalid savepoint name: {0}")]
    InvalidSavepointName(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("manifest cannot reference itself")]
    ManifestSelfReference,

    #[error("invalid layer URL pattern: {0}")]
    InvalidUrlPattern(#[from] regex::Error),
}

impl Error {
    /// Transient errors are returned to the caller without postponing the GC
    /// task under review: the task is still due and the next poll retries it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TxDeadlineExceeded
                | Error::Sqlx(sqlx::Error::PoolTimedOut)
                | Error::Sqlx(sqlx::Error::Io(_))
        )
    }
}

/// Fold database foreign-key violations into a dedicated kind; the GC relies
/// on them to detect references created concurrently with a delete.
pub(crate) fn map_fk_violation(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(dberr) = &e {
        if dberr.kind() == sqlx::error::ErrorKind::ForeignKeyViolation {
            tracing::warn!("foreign key violation: {dberr}");
            return Error::ForeignKeyViolation(dberr.to_string());
        }
    }
    e.into()
}
