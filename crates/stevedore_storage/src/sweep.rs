//! Offline mark-and-sweep over the content-addressable layout.
//!
//! Works without the metadata database: everything reachable from a tag link
//! is marked (manifest payloads, configs, layers, and list children,
//! transitively), then every unmarked blob and manifest revision is swept.
//! Intended for database-less deployments and consistency audits.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use stevedore_core::manifest::{
    image_manifest_from_buildkit_index, likely_buildkit_cache, partition_references,
    ManifestPayload,
};
use stevedore_core::Digest;

use crate::errors::{Error, Result};
use crate::paths::PathBuilder;
use crate::StorageDriver;

#[derive(Clone, Debug)]
pub struct SweepOptions {
    /// Report what would be deleted without deleting anything.
    pub dry_run: bool,
    /// Bound on concurrent manifest payload reads during the mark phase.
    pub max_parallel_manifest_gets: usize,
    /// Paths per bulk-delete call during the sweep phase.
    pub delete_chunk_size: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_parallel_manifest_gets: 10,
            delete_chunk_size: 1000,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub repositories: usize,
    pub manifests_marked: usize,
    pub blobs_marked: usize,
    pub manifests_eligible: usize,
    pub blobs_eligible: usize,
    pub manifests_deleted: usize,
    pub blobs_deleted: usize,
}

pub struct MarkAndSweep {
    driver: Arc<dyn StorageDriver>,
    paths: PathBuilder,
    opts: SweepOptions,
}

impl MarkAndSweep {
    pub fn new(driver: Arc<dyn StorageDriver>, paths: PathBuilder, opts: SweepOptions) -> Self {
        Self { driver, paths, opts }
    }

    pub async fn run(&self) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        let inventory = self.scan_repositories().await?;
        summary.repositories = inventory.len();

        let marked: Arc<Mutex<HashSet<Digest>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut eligible_manifests: Vec<(String, Digest)> = Vec::new();

        for (repository, contents) in &inventory {
            let payloads = self
                .load_manifests(repository, &contents.revisions)
                .await?;
            let reachable = mark_repository(contents, &payloads, &marked);
            summary.manifests_marked += reachable.len();

            for digest in &contents.revisions {
                if !reachable.contains(digest) {
                    eligible_manifests.push((repository.clone(), digest.clone()));
                }
            }
        }

        let eligible_blobs = self.scan_unmarked_blobs(&marked).await?;
        summary.blobs_marked = marked.lock().unwrap().len();
        summary.manifests_eligible = eligible_manifests.len();
        summary.blobs_eligible = eligible_blobs.len();

        if self.opts.dry_run {
            tracing::info!(
                repositories = summary.repositories,
                manifests_eligible = summary.manifests_eligible,
                blobs_eligible = summary.blobs_eligible,
                "mark-and-sweep dry run complete"
            );
            return Ok(summary);
        }

        // manifests first: a revision link must never outlive its payload blob
        for (repository, digest) in &eligible_manifests {
            let link_dir = self
                .paths
                .manifest_revision_link_path(repository, digest)
                .trim_end_matches("/link")
                .to_string();
            match self.driver.delete(&link_dir).await {
                Ok(()) => summary.manifests_deleted += 1,
                Err(Error::PathNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        for chunk in eligible_blobs.chunks(self.opts.delete_chunk_size.max(1)) {
            summary.blobs_deleted += self.driver.delete_files(chunk).await?;
        }

        tracing::info!(
            repositories = summary.repositories,
            manifests_deleted = summary.manifests_deleted,
            blobs_deleted = summary.blobs_deleted,
            "mark-and-sweep complete"
        );
        Ok(summary)
    }

    /// Walk the repositories tree once, collecting manifest revisions and tag
    /// link paths per repository, then resolve tag links with bounded
    /// parallelism. Link files that vanish mid-scan are tolerated.
    async fn scan_repositories(&self) -> Result<HashMap<String, RepositoryContents>> {
        let root = self.paths.repositories_root();
        let mut inventory: HashMap<String, RepositoryContents> = HashMap::new();
        let mut tag_links: Vec<(String, String)> = Vec::new();

        let mut entries = match self.driver.walk(&root).await {
            Ok(stream) => stream,
            // an empty registry has no repositories tree at all
            Err(Error::PathNotFound { .. }) => return Ok(inventory),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if let Some((repository, digest)) = parse_revision_link(&root, &entry.path) {
                inventory
                    .entry(repository)
                    .or_default()
                    .revisions
                    .push(digest);
            } else if let Some((repository, _tag)) = parse_tag_link(&root, &entry.path) {
                tag_links.push((repository, entry.path.clone()));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.opts.max_parallel_manifest_gets.max(1)));
        let mut set = JoinSet::new();
        for (repository, link_path) in tag_links {
            let driver = self.driver.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                match crate::links::read_link(&driver, &link_path).await {
                    Ok(digest) => Ok(Some((repository, digest))),
                    Err(Error::PathNotFound { .. }) => Ok(None),
                    Err(e) => Err(e),
                }
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Some((repository, digest)))) => {
                    inventory.entry(repository).or_default().tagged.push(digest);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    if e.is_panic() {
                        tracing::error!("tag resolution task panicked");
                    }
                    set.abort_all();
                    return Err(e.into());
                }
            }
        }

        Ok(inventory)
    }

    /// Fetch and parse the payload of every manifest revision in a
    /// repository, at most `max_parallel_manifest_gets` reads in flight.
    /// Missing payloads are skipped; the first other error cancels the rest.
    async fn load_manifests(
        &self,
        repository: &str,
        revisions: &[Digest],
    ) -> Result<HashMap<Digest, ManifestPayload>> {
        let semaphore = Arc::new(Semaphore::new(self.opts.max_parallel_manifest_gets.max(1)));
        let mut set = JoinSet::new();

        for digest in revisions {
            let driver = self.driver.clone();
            let path = self.paths.blob_data_path(digest);
            let digest = digest.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let content = match driver.get_content(&path).await {
                    Ok(c) => c,
                    Err(Error::PathNotFound { .. }) => return Ok(None),
                    Err(e) => return Err(e),
                };
                let payload = ManifestPayload::detect(&content)?;
                Ok(Some((digest, payload)))
            });
        }

        let mut payloads = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Some((digest, payload)))) => {
                    payloads.insert(digest, payload);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    set.abort_all();
                    tracing::error!(repository, error = %e, "mark phase aborted");
                    return Err(e);
                }
                Err(e) => {
                    if e.is_panic() {
                        tracing::error!(repository, "manifest load task panicked");
                    }
                    set.abort_all();
                    return Err(e.into());
                }
            }
        }
        Ok(payloads)
    }

    /// Walk the blob tree and return data paths whose digest was not marked.
    async fn scan_unmarked_blobs(
        &self,
        marked: &Arc<Mutex<HashSet<Digest>>>,
    ) -> Result<Vec<String>> {
        let root = self.paths.blobs_root();
        let mut eligible = Vec::new();
        let mut entries = match self.driver.walk(&root).await {
            Ok(stream) => stream,
            Err(Error::PathNotFound { .. }) => return Ok(eligible),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if let Some(digest) = parse_blob_data_path(&root, &entry.path) {
                if !marked.lock().unwrap().contains(&digest) {
                    eligible.push(entry.path);
                }
            }
        }
        Ok(eligible)
    }
}

#[derive(Debug, Default)]
struct RepositoryContents {
    revisions: Vec<Digest>,
    tagged: Vec<Digest>,
}

/// Mark everything reachable from this repository's tags. Returns the set of
/// reachable manifest digests (marking their blob payloads and references as
/// a side effect).
fn mark_repository(
    contents: &RepositoryContents,
    payloads: &HashMap<Digest, ManifestPayload>,
    marked: &Arc<Mutex<HashSet<Digest>>>,
) -> HashSet<Digest> {
    let mut reachable: HashSet<Digest> = HashSet::new();
    let mut queue: VecDeque<Digest> = contents.tagged.iter().cloned().collect();

    while let Some(digest) = queue.pop_front() {
        if !reachable.insert(digest.clone()) {
            continue;
        }
        let mut marked = marked.lock().unwrap();
        // the manifest payload itself lives in the blob tree
        marked.insert(digest.clone());

        let Some(payload) = payloads.get(&digest) else {
            continue;
        };
        match payload {
            ManifestPayload::Image(m) => {
                for desc in m.references() {
                    marked.insert(desc.digest.clone());
                }
            }
            ManifestPayload::List(l) => {
                if likely_buildkit_cache(l) {
                    // children are layer blobs, not manifests
                    if let Ok(image) = image_manifest_from_buildkit_index(l) {
                        for desc in image.references() {
                            marked.insert(desc.digest.clone());
                        }
                    }
                    continue;
                }
                let partition = partition_references(l);
                for desc in partition.blobs {
                    marked.insert(desc.digest.clone());
                }
                drop(marked);
                for desc in partition.manifests {
                    queue.push_back(desc.digest);
                }
            }
            ManifestPayload::Signed(s) => {
                for digest in s.layer_digests() {
                    marked.insert(digest);
                }
            }
        }
    }

    reachable
}

fn parse_revision_link(root: &str, path: &str) -> Option<(String, Digest)> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    let (repository, tail) = rest.split_once("/_manifests/revisions/")?;
    let mut parts = tail.split('/');
    let algorithm = parts.next()?;
    let hex = parts.next()?;
    if parts.next()? != "link" || parts.next().is_some() {
        return None;
    }
    let digest = Digest::try_from(format!("{algorithm}:{hex}").as_str()).ok()?;
    Some((repository.to_string(), digest))
}

fn parse_tag_link(root: &str, path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    let (repository, tail) = rest.split_once("/_manifests/tags/")?;
    let mut parts = tail.split('/');
    let tag = parts.next()?;
    if parts.next()? != "current" || parts.next()? != "link" || parts.next().is_some() {
        return None;
    }
    Some((repository.to_string(), tag.to_string()))
}

fn parse_blob_data_path(root: &str, path: &str) -> Option<Digest> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    let mut parts = rest.split('/');
    let algorithm = parts.next()?;
    let _shard = parts.next()?;
    let hex = parts.next()?;
    if parts.next()? != "data" || parts.next().is_some() {
        return None;
    }
    Digest::try_from(format!("{algorithm}:{hex}").as_str()).ok()
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use stevedore_core::manifest::mediatype;

    use super::*;
    use crate::blobs::{BlobService, RedirectOptions};
    use crate::inmemory::InMemoryDriver;
    use crate::links::RepositoryLinks;

    struct Fixture {
        driver: Arc<dyn StorageDriver>,
        paths: PathBuilder,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                driver: Arc::new(InMemoryDriver::new()),
                paths: PathBuilder::new("/registry"),
            }
        }

        fn blobs(&self, repository: &str) -> BlobService {
            BlobService::new(
                self.driver.clone(),
                self.paths.clone(),
                repository,
                RedirectOptions::default(),
            )
        }

        fn links(&self, repository: &str) -> RepositoryLinks {
            RepositoryLinks::new(self.driver.clone(), self.paths.clone(), repository)
        }

        fn sweeper(&self, dry_run: bool) -> MarkAndSweep {
            MarkAndSweep::new(
                self.driver.clone(),
                self.paths.clone(),
                SweepOptions {
                    dry_run,
                    ..Default::default()
                },
            )
        }

        /// Store a config + one layer + an image manifest referencing them,
        /// link the revision, and optionally tag it.
        async fn push_image(
            &self,
            repository: &str,
            seed: &str,
            tag: Option<&str>,
        ) -> (Digest, Digest, Digest) {
            let blobs = self.blobs(repository);
            let config = blobs
                .put(
                    mediatype::OCI_IMAGE_CONFIG,
                    Bytes::from(format!("{{\"cfg\":\"{seed}\"}}")),
                )
                .await
                .unwrap();
            let layer = blobs
                .put(
                    "application/vnd.oci.image.layer.v1.tar+gzip",
                    Bytes::from(format!("layer-{seed}")),
                )
                .await
                .unwrap();

            let manifest = serde_json::json!({
                "schemaVersion": 2,
                "mediaType": mediatype::OCI_MANIFEST,
                "config": {
                    "mediaType": mediatype::OCI_IMAGE_CONFIG,
                    "digest": config.digest.to_string(),
                    "size": config.size,
                },
                "layers": [{
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": layer.digest.to_string(),
                    "size": layer.size,
                }],
            });
            let payload = Bytes::from(serde_json::to_vec(&manifest).unwrap());
            let manifest_desc = blobs.put(mediatype::OCI_MANIFEST, payload).await.unwrap();

            let links = self.links(repository);
            links
                .link_manifest_revision(&manifest_desc.digest)
                .await
                .unwrap();
            if let Some(tag) = tag {
                links.tag(tag, &manifest_desc.digest).await.unwrap();
            }
            (manifest_desc.digest, config.digest, layer.digest)
        }
    }

    #[tokio::test]
    async fn empty_registry() {
        let fx = Fixture::new();
        let summary = fx.sweeper(false).run().await.unwrap();
        assert_eq!(summary, SweepSummary::default());
    }

    #[tokio::test]
    async fn tagged_image_survives() {
        let fx = Fixture::new();
        let (manifest, config, layer) = fx.push_image("app", "a", Some("latest")).await;

        let summary = fx.sweeper(false).run().await.unwrap();
        assert_eq!(summary.repositories, 1);
        assert_eq!(summary.manifests_marked, 1);
        assert_eq!(summary.blobs_deleted, 0);

        let blobs = fx.blobs("app");
        for digest in [&manifest, &config, &layer] {
            assert!(blobs.stat(digest).await.is_ok());
        }
    }

    #[tokio::test]
    async fn untagged_image_is_swept() {
        let fx = Fixture::new();
        let (kept_m, ..) = fx.push_image("app", "keep", Some("latest")).await;
        let (doomed_m, doomed_c, doomed_l) = fx.push_image("app", "doom", None).await;

        let summary = fx.sweeper(false).run().await.unwrap();
        assert_eq!(summary.manifests_deleted, 1);
        assert_eq!(summary.blobs_deleted, 3);

        let blobs = fx.blobs("app");
        assert!(blobs.stat(&kept_m).await.is_ok());
        for digest in [&doomed_m, &doomed_c, &doomed_l] {
            assert!(blobs.stat(digest).await.unwrap_err().is_not_found());
        }
    }

    #[tokio::test]
    async fn dry_run_deletes_nothing() {
        let fx = Fixture::new();
        fx.push_image("app", "doom", None).await;

        let summary = fx.sweeper(true).run().await.unwrap();
        assert_eq!(summary.manifests_eligible, 1);
        assert_eq!(summary.blobs_eligible, 3);
        assert_eq!(summary.manifests_deleted, 0);
        assert_eq!(summary.blobs_deleted, 0);

        // everything still present
        let again = fx.sweeper(true).run().await.unwrap();
        assert_eq!(again.blobs_eligible, 3);
    }

    #[tokio::test]
    async fn list_children_are_marked_transitively() {
        let fx = Fixture::new();
        // child is untagged; only the index is tagged
        let (child, child_cfg, child_layer) = fx.push_image("app", "child", None).await;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": mediatype::OCI_INDEX,
            "manifests": [{
                "mediaType": mediatype::OCI_MANIFEST,
                "digest": child.to_string(),
                "size": 1,
                "platform": { "architecture": "amd64", "os": "linux" },
            }],
        });
        let blobs = fx.blobs("app");
        let index_desc = blobs
            .put(
                mediatype::OCI_INDEX,
                Bytes::from(serde_json::to_vec(&index).unwrap()),
            )
            .await
            .unwrap();
        let links = fx.links("app");
        links.link_manifest_revision(&index_desc.digest).await.unwrap();
        links.tag("multi", &index_desc.digest).await.unwrap();

        let summary = fx.sweeper(false).run().await.unwrap();
        assert_eq!(summary.manifests_marked, 2);
        assert_eq!(summary.blobs_deleted, 0);

        for digest in [&index_desc.digest, &child, &child_cfg, &child_layer] {
            assert!(blobs.stat(digest).await.is_ok());
        }
    }

    #[tokio::test]
    async fn buildkit_cache_children_are_marked_as_layers() {
        let fx = Fixture::new();
        let blobs = fx.blobs("cache");
        let cfg = blobs
            .put(mediatype::BUILDKIT_CACHE_CONFIG, Bytes::from_static(b"cache-config"))
            .await
            .unwrap();
        let layer = blobs
            .put("application/vnd.buildkit.cachelayer.v0", Bytes::from_static(b"cache-layer"))
            .await
            .unwrap();

        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": mediatype::OCI_INDEX,
            "manifests": [
                { "mediaType": mediatype::BUILDKIT_CACHE_CONFIG,
                  "digest": cfg.digest.to_string(), "size": cfg.size },
                { "mediaType": "application/vnd.buildkit.cachelayer.v0",
                  "digest": layer.digest.to_string(), "size": layer.size },
            ],
        });
        let index_desc = blobs
            .put(
                mediatype::OCI_INDEX,
                Bytes::from(serde_json::to_vec(&index).unwrap()),
            )
            .await
            .unwrap();
        let links = fx.links("cache");
        links.link_manifest_revision(&index_desc.digest).await.unwrap();
        links.tag("buildcache", &index_desc.digest).await.unwrap();

        let summary = fx.sweeper(false).run().await.unwrap();
        assert_eq!(summary.blobs_deleted, 0);
        for digest in [&index_desc.digest, &cfg.digest, &layer.digest] {
            assert!(blobs.stat(digest).await.is_ok());
        }
    }

    #[tokio::test]
    async fn cross_repository_sharing_is_respected() {
        let fx = Fixture::new();
        // identical content pushed to two repositories dedups to shared blobs
        let (m_a, ..) = fx.push_image("repo-a", "same", Some("latest")).await;
        let (m_b, ..) = fx.push_image("repo-b", "same", None).await;
        assert_eq!(m_a, m_b);

        // repo-b's revision is untagged, but the shared blobs are reachable
        // through repo-a's tag, so only repo-b's revision link goes away
        let summary = fx.sweeper(false).run().await.unwrap();
        assert_eq!(summary.manifests_deleted, 1);
        assert_eq!(summary.blobs_deleted, 0);
        assert!(fx.blobs("repo-a").stat(&m_a).await.is_ok());
    }

    #[test]
    fn path_parsers() {
        let root = "/registry/repositories";
        let digest = Digest::from_bytes(b"m");
        let hex = digest.encoded();

        let (repo, parsed) = parse_revision_link(
            root,
            &format!("{root}/a/b/_manifests/revisions/sha256/{hex}/link"),
        )
        .unwrap();
        assert_eq!(repo, "a/b");
        assert_eq!(parsed, digest);

        let (repo, tag) = parse_tag_link(
            root,
            &format!("{root}/a/b/_manifests/tags/v1.0/current/link"),
        )
        .unwrap();
        assert_eq!((repo.as_str(), tag.as_str()), ("a/b", "v1.0"));

        assert!(parse_tag_link(root, &format!("{root}/a/_layers/sha256/{hex}/link")).is_none());

        let blob_root = "/registry/blobs";
        let parsed = parse_blob_data_path(
            blob_root,
            &format!("{blob_root}/sha256/{}/{hex}/data", &hex[..2]),
        )
        .unwrap();
        assert_eq!(parsed, digest);
        assert!(parse_blob_data_path(blob_root, &format!("{blob_root}/sha256/ab/short/data")).is_none());
    }
}
