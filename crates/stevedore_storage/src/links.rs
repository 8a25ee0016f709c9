//! Link files tie repositories to the content-addressable blob tree.
//!
//! A link file's entire content is one digest in canonical text form. The
//! offline mark-and-sweep pass and legacy database-less deployments read and
//! write these; the relational metadata store supersedes them otherwise.
use std::sync::Arc;

use bytes::Bytes;
use stevedore_core::Digest;

use crate::errors::{Error, Result};
use crate::paths::PathBuilder;
use crate::StorageDriver;

pub async fn write_link(driver: &Arc<dyn StorageDriver>, path: &str, digest: &Digest) -> Result<()> {
    driver
        .put_content(path, Bytes::from(digest.to_string()))
        .await
}

pub async fn read_link(driver: &Arc<dyn StorageDriver>, path: &str) -> Result<Digest> {
    let content = driver.get_content(path).await?;
    let text = std::str::from_utf8(&content).map_err(|_| Error::MalformedLink {
        path: path.to_string(),
    })?;
    Digest::try_from(text.trim()).map_err(|_| Error::MalformedLink {
        path: path.to_string(),
    })
}

/// Link-file operations scoped to one repository.
#[derive(Clone)]
pub struct RepositoryLinks {
    driver: Arc<dyn StorageDriver>,
    paths: PathBuilder,
    repository: String,
}

impl RepositoryLinks {
    pub fn new(driver: Arc<dyn StorageDriver>, paths: PathBuilder, repository: &str) -> Self {
        Self {
            driver,
            paths,
            repository: repository.to_string(),
        }
    }

    pub async fn link_manifest_revision(&self, digest: &Digest) -> Result<()> {
        let path = self
            .paths
            .manifest_revision_link_path(&self.repository, digest);
        write_link(&self.driver, &path, digest).await
    }

    pub async fn link_layer(&self, digest: &Digest) -> Result<()> {
        let path = self.paths.layer_link_path(&self.repository, digest);
        write_link(&self.driver, &path, digest).await
    }

    pub async fn tag(&self, name: &str, digest: &Digest) -> Result<()> {
        let path = self.paths.tag_current_link_path(&self.repository, name);
        write_link(&self.driver, &path, digest).await
    }

    pub async fn resolve_tag(&self, name: &str) -> Result<Digest> {
        let path = self.paths.tag_current_link_path(&self.repository, name);
        read_link(&self.driver, &path).await
    }
}
