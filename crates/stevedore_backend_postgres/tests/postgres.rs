//! End-to-end tests against a real Postgres database.
//!
//! Run with a throwaway database:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/stevedore_test cargo test -- --ignored
//! ```
use std::sync::Arc;

use bytes::Bytes;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use stevedore_backend_postgres::{
    BlobStore, BlobWorker, GcBlobTaskStore, GcConfig, GcManifestTaskStore, ManifestService,
    ManifestServiceConfig, ManifestWorker, MetadataPool, RepositoryStore, Worker,
};
use stevedore_core::manifest::{mediatype, ManifestRef};
use stevedore_core::{Digest, Error as CoreError};
use stevedore_storage::inmemory::InMemoryDriver;
use stevedore_storage::{BlobService, PathBuilder, RedirectOptions};

struct Harness {
    pool: MetadataPool,
    driver: Arc<InMemoryDriver>,
    paths: PathBuilder,
}

impl Harness {
    async fn new() -> Self {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a disposable postgres database");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("failed to connect to postgres");
        let pool = MetadataPool::new(pool);
        pool.migrate().await.expect("failed to run migrations");
        Self {
            pool,
            driver: Arc::new(InMemoryDriver::new()),
            paths: PathBuilder::new("/registry"),
        }
    }

    fn blob_service(&self, repository: &str) -> BlobService {
        let driver: Arc<dyn stevedore_storage::StorageDriver> = self.driver.clone();
        BlobService::new(driver, self.paths.clone(), repository, RedirectOptions::default())
    }

    /// Service whose review tasks come due immediately, so workers can be
    /// exercised without waiting out the production delay.
    fn service(&self, review_delay_secs: i64) -> ManifestService {
        ManifestService::new(
            self.pool.clone(),
            &ManifestServiceConfig {
                review_delay_secs,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn gc_config(&self) -> GcConfig {
        GcConfig {
            review_delay_secs: 0,
            ..Default::default()
        }
    }

    fn blob_worker(&self) -> BlobWorker {
        let driver: Arc<dyn stevedore_storage::StorageDriver> = self.driver.clone();
        BlobWorker::new(self.pool.clone(), driver, self.paths.clone(), self.gc_config())
    }

    fn manifest_worker(&self) -> ManifestWorker {
        ManifestWorker::new(self.pool.clone(), self.gc_config())
    }

    /// Upload bytes to storage and record the blob row.
    async fn seed_blob(&self, repository: &str, media_type: &str, bytes: &[u8]) -> Digest {
        let desc = self
            .blob_service(repository)
            .put(media_type, Bytes::copy_from_slice(bytes))
            .await
            .unwrap();
        let mut tx = self.pool.begin().await.unwrap();
        BlobStore::safe_create(
            tx.executor().unwrap(),
            &desc.digest,
            media_type,
            desc.size,
            chrono::Duration::zero(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        desc.digest
    }

    async fn seed_image(
        &self,
        service: &ManifestService,
        repository: &str,
        seed: &str,
        tag: Option<&str>,
    ) -> (Digest, Digest, Digest) {
        let config = self
            .seed_blob(
                repository,
                mediatype::OCI_IMAGE_CONFIG,
                format!("{{\"seed\":\"{seed}\"}}").as_bytes(),
            )
            .await;
        let layer = self
            .seed_blob(
                repository,
                "application/vnd.oci.image.layer.v1.tar+gzip",
                format!("layer-{seed}").as_bytes(),
            )
            .await;
        let payload = image_manifest_json(&config, &layer);
        let manifest = service
            .put(
                &self.blob_service(repository),
                repository,
                mediatype::OCI_MANIFEST,
                Bytes::from(payload),
                tag,
            )
            .await
            .unwrap();
        (manifest.digest.clone(), config, layer)
    }
}

fn unique_repo(prefix: &str) -> String {
    format!("{prefix}/{}", Uuid::new_v4().simple())
}

fn image_manifest_json(config: &Digest, layer: &Digest) -> String {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mediatype::OCI_MANIFEST,
        "config": {
            "mediaType": mediatype::OCI_IMAGE_CONFIG,
            "digest": config.to_string(),
            "size": 1,
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer.to_string(),
            "size": 1,
        }],
    })
    .to_string()
}

fn index_json(children: &[(&str, &Digest)]) -> String {
    serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mediatype::OCI_INDEX,
        "manifests": children
            .iter()
            .map(|(mt, d)| {
                serde_json::json!({ "mediaType": mt, "digest": d.to_string(), "size": 1 })
            })
            .collect::<Vec<_>>(),
    })
    .to_string()
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn push_then_pull_by_tag_and_digest() {
    let h = Harness::new().await;
    let service = h.service(86_400);
    let repo = unique_repo("push-pull");

    let config = h
        .seed_blob(&repo, mediatype::OCI_IMAGE_CONFIG, b"{\"arch\":\"amd64\"}")
        .await;
    let layer = h
        .seed_blob(&repo, "application/vnd.oci.image.layer.v1.tar+gzip", b"layer-bytes")
        .await;

    let payload = image_manifest_json(&config, &layer);
    let stored = service
        .put(
            &h.blob_service(&repo),
            &repo,
            mediatype::OCI_MANIFEST,
            Bytes::from(payload.clone()),
            Some("latest"),
        )
        .await
        .unwrap();
    assert_eq!(stored.digest, Digest::from_bytes(payload.as_bytes()));

    let by_tag = service
        .get(&repo, &ManifestRef::Tag("latest".to_string()))
        .await
        .unwrap();
    assert_eq!(by_tag.payload, payload.as_bytes());

    let by_digest = service
        .get(&repo, &ManifestRef::Digest(stored.digest.clone()))
        .await
        .unwrap();
    assert_eq!(by_digest.payload, by_tag.payload);
    assert_eq!(by_digest.media_type, mediatype::OCI_MANIFEST);
    assert_eq!(
        by_digest.configuration.as_ref().unwrap().blob_digest,
        config
    );

    // pushing the identical payload again is a no-op returning the same row
    let again = service
        .put(
            &h.blob_service(&repo),
            &repo,
            mediatype::OCI_MANIFEST,
            Bytes::from(payload),
            None,
        )
        .await
        .unwrap();
    assert_eq!(again.id, stored.id);

    // the repository listing includes the pushed manifest
    let mut conn = h.pool.conn().await.unwrap();
    let repo_row = RepositoryStore::find_by_path(conn.executor(), &repo)
        .await
        .unwrap()
        .unwrap();
    let listed = stevedore_backend_postgres::ManifestStore::list_for_repository(
        conn.executor(),
        repo_row.id,
    )
    .await
    .unwrap();
    assert!(listed.iter().any(|m| m.id == stored.id));
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn missing_dependencies_are_aggregated() {
    let h = Harness::new().await;
    let service = h.service(86_400);
    let repo = unique_repo("missing-deps");

    let config = Digest::from_bytes(b"never-uploaded-config");
    let layer = Digest::from_bytes(b"never-uploaded-layer");
    let err = service
        .put(
            &h.blob_service(&repo),
            &repo,
            mediatype::OCI_MANIFEST,
            Bytes::from(image_manifest_json(&config, &layer)),
            None,
        )
        .await
        .unwrap_err();

    // one aggregate error naming every missing digest
    let message = err.to_string();
    assert!(message.contains(&config.to_string()), "{message}");
    assert!(message.contains(&layer.to_string()), "{message}");
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn blob_shared_across_repositories_survives_gc() {
    let h = Harness::new().await;
    let service = h.service(0);
    let repo_a = unique_repo("dedup-a");
    let repo_b = unique_repo("dedup-b");

    // identical layer bytes in both repositories: one blob row, two links
    let (manifest_a, _config_a, layer) =
        h.seed_image(&service, &repo_a, "shared", Some("latest")).await;
    h.seed_image(&service, &repo_b, "shared", Some("latest")).await;

    {
        let mut conn = h.pool.conn().await.unwrap();
        let repo = RepositoryStore::find_by_path(conn.executor(), &repo_a)
            .await
            .unwrap()
            .unwrap();
        assert!(RepositoryStore::blobs(conn.executor(), repo.id)
            .await
            .unwrap()
            .iter()
            .any(|b| b.digest == layer));
    }

    // drop repo A's tag and manifest so its references disappear
    service.delete_tag(&repo_a, "latest").await.unwrap();
    service.delete(&repo_a, &manifest_a).await.unwrap();
    {
        let mut tx = h.pool.begin().await.unwrap();
        let repo = RepositoryStore::find_by_path(tx.executor().unwrap(), &repo_a)
            .await
            .unwrap()
            .unwrap();
        RepositoryStore::unlink_blob(tx.executor().unwrap(), repo.id, &layer)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    // drain the blob queue; the shared layer is still referenced by repo B
    let worker = h.blob_worker();
    while worker.run_once().await.unwrap() {}

    let mut conn = h.pool.conn().await.unwrap();
    assert!(BlobStore::find(conn.executor(), &layer)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn tag_switch_enqueues_only_the_replaced_manifest() {
    let h = Harness::new().await;
    // production delay: the task exists but is not yet due
    let service = h.service(86_400);
    let repo = unique_repo("tag-switch");

    let (m1, ..) = h.seed_image(&service, &repo, "one", Some("latest")).await;
    let (m2, ..) = h.seed_image(&service, &repo, "two", Some("latest")).await;
    assert_ne!(m1, m2);

    {
        let mut tx = h.pool.begin().await.unwrap();
        let repo_row = RepositoryStore::find_by_path(tx.executor().unwrap(), &repo)
            .await
            .unwrap()
            .unwrap();
        let m1_row = stevedore_backend_postgres::ManifestStore::find_by_digest(
            tx.executor().unwrap(),
            repo_row.id,
            &m1,
        )
        .await
        .unwrap()
        .unwrap();
        let m2_row = stevedore_backend_postgres::ManifestStore::find_by_digest(
            tx.executor().unwrap(),
            repo_row.id,
            &m2,
        )
        .await
        .unwrap()
        .unwrap();

        let task = GcManifestTaskStore::find_and_lock(
            tx.executor().unwrap(),
            repo_row.namespace_id,
            repo_row.id,
            m1_row.id,
        )
        .await
        .unwrap();
        let task = task.expect("replaced manifest must be enqueued");
        assert!(task.review_after > chrono::Utc::now());

        // the new tag target is not enqueued
        assert!(GcManifestTaskStore::find_and_lock(
            tx.executor().unwrap(),
            repo_row.namespace_id,
            repo_row.id,
            m2_row.id,
        )
        .await
        .unwrap()
        .is_none());
        tx.rollback().await.unwrap();
    }

    // nothing is due yet, so the worker finds no task
    assert!(!h.manifest_worker().run_once().await.unwrap());
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn tag_switch_then_gc_deletes_untagged_manifest() {
    let h = Harness::new().await;
    let service = h.service(0);
    let repo = unique_repo("tag-switch-gc");

    let (m1, ..) = h.seed_image(&service, &repo, "one", Some("latest")).await;
    h.seed_image(&service, &repo, "two", Some("latest")).await;

    let worker = h.manifest_worker();
    while worker.run_once().await.unwrap() {}

    let err = service
        .get(&repo, &ManifestRef::Digest(m1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        stevedore_backend_postgres::Error::Core(CoreError::ManifestUnknown(_))
    ));

    // the tagged manifest is untouched
    assert!(service
        .get(&repo, &ManifestRef::Tag("latest".to_string()))
        .await
        .is_ok());
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn list_delete_reviews_children() {
    let h = Harness::new().await;
    let service = h.service(0);
    let repo = unique_repo("list-delete");

    // c1 keeps a tag; c2 is reachable only through the list
    let (c1, ..) = h.seed_image(&service, &repo, "child-1", Some("keep")).await;
    let (c2, ..) = h.seed_image(&service, &repo, "child-2", None).await;

    let index = index_json(&[
        (mediatype::OCI_MANIFEST, &c1),
        (mediatype::OCI_MANIFEST, &c2),
    ]);
    let list = service
        .put(
            &h.blob_service(&repo),
            &repo,
            mediatype::OCI_INDEX,
            Bytes::from(index),
            Some("multi"),
        )
        .await
        .unwrap();

    // a child of a live list cannot be deleted directly
    let err = service.delete(&repo, &c1).await.unwrap_err();
    assert!(matches!(
        err,
        stevedore_backend_postgres::Error::Core(CoreError::ManifestReferencedInList(_))
    ));

    service.delete_tag(&repo, "multi").await.unwrap();
    service.delete(&repo, &list.digest).await.unwrap();

    let worker = h.manifest_worker();
    while worker.run_once().await.unwrap() {}

    // the tagged child survives, the untagged one is reclaimed
    assert!(service.get(&repo, &ManifestRef::Digest(c1)).await.is_ok());
    assert!(service.get(&repo, &ManifestRef::Digest(c2)).await.is_err());
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn buildkit_cache_index_children_validate_as_blobs() {
    let h = Harness::new().await;
    let service = h.service(86_400);
    let repo = unique_repo("buildkit");

    let cache_config = h
        .seed_blob(&repo, mediatype::BUILDKIT_CACHE_CONFIG, b"cache-config")
        .await;
    let cache_layer = h
        .seed_blob(&repo, "application/vnd.buildkit.cachelayer.v0", b"cache-layer")
        .await;

    // with the sentinel present the children are validated as blobs
    let with_sentinel = index_json(&[
        (mediatype::BUILDKIT_CACHE_CONFIG, &cache_config),
        ("application/vnd.buildkit.cachelayer.v0", &cache_layer),
    ]);
    service
        .put(
            &h.blob_service(&repo),
            &repo,
            mediatype::OCI_INDEX,
            Bytes::from(with_sentinel),
            None,
        )
        .await
        .unwrap();

    // without it, every child must be a manifest, and none of these are
    let without_sentinel =
        index_json(&[("application/vnd.buildkit.cachelayer.v0", &cache_layer)]);
    let err = service
        .put(
            &h.blob_service(&repo),
            &repo,
            mediatype::OCI_INDEX,
            Bytes::from(without_sentinel),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains(&cache_layer.to_string()));
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn workers_do_not_contend_for_one_task() {
    let h = Harness::new().await;
    let repo = unique_repo("contention");

    // one due task: an unreferenced blob
    let digest = h
        .seed_blob(&repo, "application/octet-stream", b"orphan-to-be")
        .await;
    {
        let mut tx = h.pool.begin().await.unwrap();
        GcBlobTaskStore::queue(
            tx.executor().unwrap(),
            &digest,
            "test_orphan",
            chrono::Duration::zero(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    let w1 = h.blob_worker();
    let w2 = h.blob_worker();
    let (r1, r2) = tokio::join!(w1.run_once(), w2.run_once());
    let found = [r1.unwrap(), r2.unwrap()];
    assert_eq!(found.iter().filter(|f| **f).count(), 1, "{found:?}");

    let mut conn = h.pool.conn().await.unwrap();
    assert!(BlobStore::find(conn.executor(), &digest)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn review_after_never_moves_backwards() {
    let h = Harness::new().await;
    let repo = unique_repo("postpone");
    let digest = h.seed_blob(&repo, "application/octet-stream", b"postponed").await;

    let mut tx = h.pool.begin().await.unwrap();
    GcBlobTaskStore::queue(
        tx.executor().unwrap(),
        &digest,
        "first",
        chrono::Duration::hours(48),
    )
    .await
    .unwrap();
    let first = GcBlobTaskStore::find_and_lock(tx.executor().unwrap(), &digest)
        .await
        .unwrap()
        .unwrap();

    // a later event with a shorter delay must not pull the review forward
    GcBlobTaskStore::queue(
        tx.executor().unwrap(),
        &digest,
        "second",
        chrono::Duration::hours(1),
    )
    .await
    .unwrap();
    let second = GcBlobTaskStore::find_and_lock(tx.executor().unwrap(), &digest)
        .await
        .unwrap()
        .unwrap();
    assert!(second.review_after >= first.review_after);
    assert_eq!(second.review_count, first.review_count);
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a postgres database via DATABASE_URL"]
async fn savepoints_scope_nested_work() {
    let h = Harness::new().await;
    let service = h.service(86_400);
    let repo = unique_repo("savepoints");

    let (digest, ..) = h.seed_image(&service, &repo, "sp", Some("latest")).await;

    let mut tx = h.pool.begin().await.unwrap();
    tx.savepoint("before_tag").await.unwrap();

    let repo_row = RepositoryStore::find_by_path(tx.executor().unwrap(), &repo)
        .await
        .unwrap()
        .unwrap();
    let manifest = stevedore_backend_postgres::ManifestStore::find_by_digest(
        tx.executor().unwrap(),
        repo_row.id,
        &digest,
    )
    .await
    .unwrap()
    .unwrap();
    stevedore_backend_postgres::TagStore::upsert(
        tx.executor().unwrap(),
        repo_row.namespace_id,
        repo_row.id,
        "scratch",
        manifest.id,
        chrono::Duration::hours(24),
    )
    .await
    .unwrap();

    tx.rollback_to("before_tag").await.unwrap();
    tx.commit().await.unwrap();

    // the nested tag write was rolled back, the transaction still committed
    let mut conn = h.pool.conn().await.unwrap();
    assert!(stevedore_backend_postgres::TagStore::find(
        conn.executor(),
        repo_row.id,
        "scratch"
    )
    .await
    .unwrap()
    .is_none());
}
