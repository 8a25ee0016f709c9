use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header;
use http::{Method, Response, StatusCode};
use hyper::Body;
use serde::Deserialize;
use stevedore_core::manifest::Descriptor;
use stevedore_core::Digest;

use crate::errors::{Error, Result};
use crate::paths::PathBuilder;
use crate::upload::{BlobUpload, OCTET_STREAM};
use crate::{ByteStream, StorageDriver};

fn default_redirect_expiry_secs() -> u64 {
    20 * 60
}

/// Presigned-redirect policy for blob downloads.
#[derive(Clone, Debug, Deserialize)]
pub struct RedirectOptions {
    #[serde(default)]
    pub disable: bool,
    #[serde(default = "default_redirect_expiry_secs")]
    pub expiry_secs: u64,
}

impl Default for RedirectOptions {
    fn default() -> Self {
        Self {
            disable: false,
            expiry_secs: default_redirect_expiry_secs(),
        }
    }
}

/// Process-local descriptor cache.
///
/// Blobs are immutable and content-addressed, so a cached descriptor can only
/// go stale by deletion; the delete path invalidates.
#[derive(Default)]
pub struct DescriptorCache {
    inner: Mutex<HashMap<Digest, Descriptor>>,
}

impl DescriptorCache {
    pub fn get(&self, digest: &Digest) -> Option<Descriptor> {
        self.inner.lock().unwrap().get(digest).cloned()
    }

    pub fn set(&self, desc: Descriptor) {
        self.inner.lock().unwrap().insert(desc.digest.clone(), desc);
    }

    pub fn invalidate(&self, digest: &Digest) {
        self.inner.lock().unwrap().remove(digest);
    }
}

/// Content-addressed blob access over a storage driver, scoped to one
/// repository for uploads.
#[derive(Clone)]
pub struct BlobService {
    driver: Arc<dyn StorageDriver>,
    paths: PathBuilder,
    repository: String,
    redirect: RedirectOptions,
    cache: Arc<DescriptorCache>,
}

impl BlobService {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        paths: PathBuilder,
        repository: &str,
        redirect: RedirectOptions,
    ) -> Self {
        Self {
            driver,
            paths,
            repository: repository.to_string(),
            redirect,
            cache: Arc::new(DescriptorCache::default()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn path_builder(&self) -> &PathBuilder {
        &self.paths
    }

    /// Descriptor for a stored blob, or [`Error::PathNotFound`].
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        if let Some(desc) = self.cache.get(digest) {
            return Ok(desc);
        }
        let info = self.driver.stat(&self.paths.blob_data_path(digest)).await?;
        let desc = Descriptor {
            media_type: OCTET_STREAM.to_string(),
            digest: digest.clone(),
            size: info.size as i64,
            urls: None,
            platform: None,
        };
        self.cache.set(desc.clone());
        Ok(desc)
    }

    /// Whole blob content in memory; for configs and manifests, not layers.
    pub async fn get(&self, digest: &Digest) -> Result<Bytes> {
        self.driver
            .get_content(&self.paths.blob_data_path(digest))
            .await
    }

    /// Stream blob content from `offset`.
    pub async fn open(&self, digest: &Digest, offset: u64) -> Result<ByteStream> {
        self.driver
            .reader(&self.paths.blob_data_path(digest), offset)
            .await
    }

    /// One-shot upload for small blobs.
    pub async fn put(&self, media_type: &str, content: Bytes) -> Result<Descriptor> {
        let mut upload = self.create().await?;
        upload.write(content).await?;
        let mut desc = upload.commit(None).await?;
        desc.media_type = media_type.to_string();
        Ok(desc)
    }

    /// Start a resumable upload.
    pub async fn create(&self) -> Result<BlobUpload> {
        BlobUpload::create(self.driver.clone(), self.paths.clone(), &self.repository).await
    }

    /// Delete the backing object for a digest and drop it from the cache.
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        self.cache.invalidate(digest);
        self.driver.delete(&self.paths.blob_path(digest)).await
    }

    /// Serve a blob over HTTP: a `307` to a presigned URL when redirects are
    /// enabled and the driver supports the method, a streamed response
    /// otherwise. `UnsupportedMethod` from the driver falls back to streaming
    /// silently; any other driver error surfaces.
    pub async fn serve_blob(&self, method: &Method, digest: &Digest) -> Result<Response<Body>> {
        let desc = self.stat(digest).await?;
        let path = self.paths.blob_data_path(digest);

        if !self.redirect.disable {
            match self
                .driver
                .url_for(&path, method, Duration::from_secs(self.redirect.expiry_secs))
                .await
            {
                Ok(url) => {
                    tracing::debug!(%digest, "redirecting blob download");
                    return Ok(Response::builder()
                        .status(StatusCode::TEMPORARY_REDIRECT)
                        .header(header::LOCATION, url)
                        .header("Docker-Content-Digest", digest.to_string())
                        .body(Body::empty())?);
                }
                Err(Error::UnsupportedMethod) => {}
                Err(e) => return Err(e),
            }
        }

        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::ETAG, format!("\"{digest}\""))
            .header(header::CACHE_CONTROL, "max-age=31536000")
            .header("Docker-Content-Digest", digest.to_string())
            .header(header::CONTENT_TYPE, desc.media_type.as_str())
            .header(header::CONTENT_LENGTH, desc.size);

        if *method == Method::HEAD {
            return Ok(builder.body(Body::empty())?);
        }

        let stream = self.open(digest, 0).await?;
        Ok(builder.body(Body::wrap_stream(stream))?)
    }
}
