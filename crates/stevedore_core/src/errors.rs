use crate::digest::Digest;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),

    #[error("unknown manifest media type: {0}")]
    UnknownMediaType(String),
    #[error("malformed manifest payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("manifest schema version {0} not supported")]
    UnsupportedSchemaVersion(i32),

    #[error("blob unknown to registry: {0}")]
    BlobUnknown(Digest),
    #[error("manifest unknown to registry: {0}")]
    ManifestUnknown(String),
    #[error("referenced manifest not found: {0}")]
    RefManifestNotFound(Digest),
    #[error("manifest {0} is referenced by one or more manifest lists")]
    ManifestReferencedInList(Digest),

    #[error("repository unknown: {0}")]
    RepositoryUnknown(String),
    #[error("invalid repository name: {0}")]
    RepositoryNameInvalid(String),
    #[error("invalid tag name: {0}")]
    TagNameInvalid(String),

    #[error("manifest verification failed: {0}")]
    ManifestVerification(VerificationErrors),
    #[error("too many manifest references: {count} exceeds the configured limit of {limit}")]
    ReferenceLimitExceeded { limit: usize, count: usize },

    #[error("buildkit cache index conversion failed: {0}")]
    BuildkitIndexInvalid(&'static str),
}

/// One failed check from manifest dependency verification.
///
/// Verification inspects every reference before failing so that a single error
/// reports all missing dependencies at once.
#[derive(thiserror::Error, Debug)]
pub enum VerificationError {
    #[error("manifest references unknown blob {0}")]
    BlobUnknown(Digest),
    #[error("manifest references unknown manifest {0}")]
    ManifestUnknown(Digest),
    #[error("layer {digest} URL {url:?} rejected: {reason}")]
    LayerUrlRejected {
        digest: Digest,
        url: String,
        reason: &'static str,
    },
    #[error("non-distributable layer {0} carries no URL")]
    MissingLayerUrls(Digest),
    #[error("dependency check for {digest} failed: {source}")]
    Backend {
        digest: Digest,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Default)]
pub struct VerificationErrors(pub Vec<VerificationError>);

impl VerificationErrors {
    pub fn push(&mut self, e: VerificationError) {
        self.0.push(e);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fold into a single aggregate error, or `Ok` when no check failed.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::ManifestVerification(self))
        }
    }
}

impl std::fmt::Display for VerificationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
