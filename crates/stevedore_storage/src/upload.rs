use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use stevedore_core::manifest::Descriptor;
use stevedore_core::{Digest, Digester};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::paths::PathBuilder;
use crate::StorageDriver;

/// Media type recorded for blobs whose real type is not known at the storage
/// layer.
pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadState {
    Open,
    Committed,
    Terminated,
}

/// A resumable blob upload.
///
/// Content accumulates at a UUID-keyed scratch path; `commit` is the only
/// transition that publishes content, by renaming the scratch object to its
/// content address. A failed write leaves the upload open and resumable, and
/// a commit with a digest mismatch does too.
pub struct BlobUpload {
    driver: Arc<dyn StorageDriver>,
    paths: PathBuilder,
    repository: String,
    id: Uuid,
    digester: Digester,
    state: UploadState,
}

impl BlobUpload {
    pub(crate) async fn create(
        driver: Arc<dyn StorageDriver>,
        paths: PathBuilder,
        repository: &str,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let started_at = paths.upload_started_at_path(repository, &id);
        driver
            .put_content(&started_at, Bytes::from(Utc::now().to_rfc3339()))
            .await?;
        tracing::debug!(upload_id = %id, repository, "blob upload started");
        Ok(Self {
            driver,
            paths,
            repository: repository.to_string(),
            id,
            digester: Digester::default(),
            state: UploadState::Open,
        })
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.digester.bytes()
    }

    /// Append a chunk to the upload.
    pub async fn write(&mut self, data: Bytes) -> Result<u64> {
        if self.state != UploadState::Open {
            return Err(Error::UploadTerminated);
        }
        let data_path = self.paths.upload_data_path(&self.repository, &self.id);
        let mut writer = self.driver.writer(&data_path, true).await?;
        writer.write(data.clone()).await?;
        writer.commit().await?;

        self.digester.update(&data);
        let state_path = self.paths.upload_hash_state_path(
            &self.repository,
            &self.id,
            self.digester.algorithm(),
            self.digester.bytes(),
        );
        self.driver
            .put_content(&state_path, Bytes::from(self.digester.bytes().to_string()))
            .await?;
        Ok(self.digester.bytes())
    }

    /// Abandon the upload and delete its scratch space.
    pub async fn cancel(mut self) -> Result<()> {
        self.state = UploadState::Terminated;
        let path = self.paths.upload_path(&self.repository, &self.id);
        match self.driver.delete(&path).await {
            Ok(()) | Err(Error::PathNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Finalize the upload.
    ///
    /// Verifies the streamed digest against `expected` when given; a mismatch
    /// leaves the upload open so the client can retry with the right
    /// expectation. On success the scratch object is renamed to its content
    /// address — unless an object already exists there, in which case the
    /// scratch copy is discarded and the existing object wins. That existing
    /// object is what makes cross-repository deduplication hold: one digest,
    /// one stored object, no matter how many uploads race.
    pub async fn commit(&mut self, expected: Option<&Digest>) -> Result<Descriptor> {
        if self.state != UploadState::Open {
            return Err(Error::UploadTerminated);
        }

        let actual = self.digester.clone().finalize();
        let digest = match expected {
            None => actual,
            Some(exp) if exp.algorithm() != actual.algorithm() => {
                return Err(Error::Core(stevedore_core::Error::UnsupportedDigestAlgorithm(
                    exp.algorithm().to_string(),
                )))
            }
            Some(exp) => {
                if *exp != actual {
                    tracing::info!(expected = %exp, actual = %actual, "upload digest mismatch");
                    return Err(Error::DigestMismatch {
                        expected: exp.clone(),
                        actual,
                    });
                }
                actual
            }
        };

        let size = self.digester.bytes();
        let data_path = self.paths.upload_data_path(&self.repository, &self.id);
        let dest = self.paths.blob_data_path(&digest);

        match self.driver.stat(&dest).await {
            Ok(existing) => {
                // deduplicated: another upload already published this digest
                tracing::debug!(%digest, "blob already exists, discarding upload scratch");
                self.state = UploadState::Committed;
                self.cleanup().await;
                return Ok(Descriptor {
                    media_type: OCTET_STREAM.to_string(),
                    digest,
                    size: existing.size as i64,
                    urls: None,
                    platform: None,
                });
            }
            Err(Error::PathNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        self.driver.rename(&data_path, &dest).await?;
        self.state = UploadState::Committed;
        self.cleanup().await;
        tracing::debug!(%digest, size, "blob upload committed");

        Ok(Descriptor {
            media_type: OCTET_STREAM.to_string(),
            digest,
            size: size as i64,
            urls: None,
            platform: None,
        })
    }

    /// Remove upload scratch files after commit. Failure only leaks scratch
    /// space under `_uploads/`, never published content.
    async fn cleanup(&self) {
        let path = self.paths.upload_path(&self.repository, &self.id);
        if let Err(e) = self.driver.delete(&path).await {
            if !e.is_not_found() {
                tracing::warn!(upload_id = %self.id, error = %e, "failed to clean up upload scratch");
            }
        }
    }
}
