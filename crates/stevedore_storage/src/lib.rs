//! Byte-granular storage for the registry core.
//!
//! [`StorageDriver`] is the interface the registry consumes; concrete drivers
//! for real object stores live elsewhere and are injected as
//! `Arc<dyn StorageDriver>`. On top of the driver this crate provides the
//! content-addressed path layout, the blob service with resumable uploads,
//! and the offline mark-and-sweep pass.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use regex::Regex;

pub mod blobs;
pub mod errors;
pub mod inmemory;
pub mod links;
pub mod paths;
pub mod purge;
pub mod sweep;
pub mod upload;

pub use blobs::{BlobService, DescriptorCache, RedirectOptions};
pub use errors::{Error, Result};
pub use inmemory::InMemoryDriver;
pub use links::RepositoryLinks;
pub use paths::PathBuilder;
pub use purge::{PurgeSummary, UploadPurger};
pub use sweep::{MarkAndSweep, SweepOptions, SweepSummary};
pub use upload::BlobUpload;

/// Stream of content bytes out of a driver.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Stream of walk entries.
pub type FileInfoStream = BoxStream<'static, Result<FileInfo>>;

/// Metadata for a stored object or directory.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
}

static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/[A-Za-z0-9._:=|@-]+)+$").unwrap());

/// Validate a driver path: UNIX-style, absolute, normalized.
pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !PATH_RE.is_match(path) {
        return Err(Error::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(())
}

/// Byte-granular object store consumed by the blob service and the garbage
/// collectors.
///
/// Implementations must report absence as [`Error::PathNotFound`] and an
/// unimplemented `url_for` as [`Error::UnsupportedMethod`] so that callers can
/// match on the kind.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Short driver name, for logs.
    fn name(&self) -> &'static str;

    async fn get_content(&self, path: &str) -> Result<Bytes>;

    async fn put_content(&self, path: &str, content: Bytes) -> Result<()>;

    /// Stream the object's bytes starting at `offset`.
    async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream>;

    /// Open a resumable writer. With `append` the writer continues from the
    /// current size; otherwise any existing content is truncated.
    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>>;

    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Immediate children of a directory path.
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Depth-first enumeration of all objects under `path`.
    async fn walk(&self, path: &str) -> Result<FileInfoStream>;

    /// Parallel variant of [`StorageDriver::walk`]; drivers without native
    /// support fall back to the serial walk.
    async fn walk_parallel(&self, path: &str) -> Result<FileInfoStream> {
        self.walk(path).await
    }

    async fn rename(&self, source: &str, dest: &str) -> Result<()>;

    /// Recursive delete of an object or directory subtree.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete a batch of object paths; absent paths are skipped. Returns the
    /// number of objects actually removed.
    async fn delete_files(&self, paths: &[String]) -> Result<usize>;

    /// Presigned URL for direct client access, when the driver supports it
    /// for the given method.
    async fn url_for(&self, path: &str, method: &http::Method, expiry: Duration)
        -> Result<String>;
}

/// Resumable writer over a single object.
#[async_trait]
pub trait FileWriter: Send {
    async fn write(&mut self, data: Bytes) -> Result<usize>;

    /// Bytes written so far, including any pre-existing content when opened
    /// in append mode.
    fn size(&self) -> u64;

    /// Finalize the object; after commit the content is visible to readers.
    async fn commit(&mut self) -> Result<()>;

    /// Discard the object and any buffered content.
    async fn cancel(&mut self) -> Result<()>;

    /// Release resources without finalizing; buffered content may be kept
    /// for a later append.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_validation() {
        for ok in ["/", "/blobs", "/blobs/sha256/ab/abcd/data", "/a/b-c/d_e.f"] {
            assert!(validate_path(ok).is_ok(), "{ok}");
        }
        for bad in ["", "relative/path", "//double", "/trailing/", "/sp ace"] {
            assert!(validate_path(bad).is_err(), "{bad}");
        }
    }

    // validate object safety
    #[allow(dead_code)]
    struct Holder {
        driver: std::sync::Arc<dyn StorageDriver>,
        writer: Box<dyn FileWriter>,
    }
}
