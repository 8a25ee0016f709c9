//! Manifest rows and the service that coordinates parsing, validation,
//! metadata writes, and review-task tracking.
use std::collections::HashSet;

use bytes::Bytes;
use chrono::Duration;
use regex::Regex;
use sea_query::{
    Alias, Cond, Expr, JoinType, OnConflict, PostgresQueryBuilder, Query, SelectStatement, Value,
};
use sea_query_binder::SqlxBinder;
use serde::Deserialize;
use sqlx::{PgConnection, Row};

use stevedore_core::errors::{VerificationError, VerificationErrors};
use stevedore_core::manifest::validation::{
    validate_image_manifest, validate_manifest_list, ValidatorOptions,
};
use stevedore_core::manifest::{
    likely_buildkit_cache, ImageManifest, ManifestList, ManifestPayload, ManifestRef,
    SignedManifest,
};
use stevedore_core::{names, Digest, Error as CoreError};

use crate::blobs::{BlobStore, ConfigurationStore, MediaTypeStore};
use crate::errors::{map_fk_violation, Error, Result};
use crate::gc::queues::{GcBlobTaskStore, GcManifestTaskStore};
use crate::metadata::types::{
    Manifest, ManifestLayers, ManifestReferences, Manifests, MediaTypes, Namespace, Repository,
    Tags,
};
use crate::metadata::MetadataPool;
use crate::repositories::{NamespaceStore, RepositoryStore};
use crate::tags::TagStore;
use stevedore_storage::BlobService;

fn manifest_select() -> SelectStatement {
    let cfg_mt = Alias::new("cfg_mt");
    Query::select()
        .from(Manifests::Table)
        .columns([
            (Manifests::Table, Manifests::Id),
            (Manifests::Table, Manifests::NamespaceId),
            (Manifests::Table, Manifests::RepositoryId),
            (Manifests::Table, Manifests::SchemaVersion),
            (Manifests::Table, Manifests::DigestAlgorithm),
            (Manifests::Table, Manifests::Digest),
            (Manifests::Table, Manifests::Payload),
            (Manifests::Table, Manifests::ConfigurationBlobDigestAlgorithm),
            (Manifests::Table, Manifests::ConfigurationBlobDigest),
            (Manifests::Table, Manifests::ConfigurationPayload),
            (Manifests::Table, Manifests::CreatedAt),
        ])
        .column((MediaTypes::Table, MediaTypes::MediaType))
        .expr_as(
            Expr::col((cfg_mt.clone(), MediaTypes::MediaType)),
            Alias::new("configuration_media_type"),
        )
        .inner_join(
            MediaTypes::Table,
            Expr::col((Manifests::Table, Manifests::MediaTypeId))
                .equals((MediaTypes::Table, MediaTypes::Id)),
        )
        .join_as(
            JoinType::LeftJoin,
            MediaTypes::Table,
            cfg_mt.clone(),
            Expr::col((Manifests::Table, Manifests::ConfigurationMediaTypeId))
                .equals((cfg_mt, MediaTypes::Id)),
        )
        .to_owned()
}

/// Column values for a new manifest row.
struct NewManifest<'a> {
    namespace_id: i64,
    repository_id: i64,
    schema_version: i16,
    media_type_id: i32,
    digest: &'a Digest,
    payload: &'a [u8],
    configuration: Option<NewConfiguration<'a>>,
}

struct NewConfiguration<'a> {
    media_type_id: i32,
    digest: &'a Digest,
    payload: Option<&'a [u8]>,
}

pub struct ManifestStore;

impl ManifestStore {
    pub async fn find_by_digest(
        executor: &mut PgConnection,
        repository_id: i64,
        digest: &Digest,
    ) -> Result<Option<Manifest>> {
        let mut builder = manifest_select();
        builder
            .and_where(Expr::col((Manifests::Table, Manifests::RepositoryId)).eq(repository_id))
            .and_where(
                Expr::col((Manifests::Table, Manifests::DigestAlgorithm))
                    .eq(digest.algorithm().id()),
            )
            .and_where(Expr::col((Manifests::Table, Manifests::Digest)).eq(digest.bytes()));
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn find_by_tag(
        executor: &mut PgConnection,
        repository_id: i64,
        tag: &str,
    ) -> Result<Option<Manifest>> {
        let mut builder = manifest_select();
        builder
            .inner_join(
                Tags::Table,
                Expr::col((Tags::Table, Tags::ManifestId))
                    .equals((Manifests::Table, Manifests::Id)),
            )
            .and_where(Expr::col((Tags::Table, Tags::RepositoryId)).eq(repository_id))
            .and_where(Expr::col((Tags::Table, Tags::Name)).eq(tag));
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn find_by_id(
        executor: &mut PgConnection,
        manifest_id: i64,
    ) -> Result<Option<Manifest>> {
        let mut builder = manifest_select();
        builder.and_where(Expr::col((Manifests::Table, Manifests::Id)).eq(manifest_id));
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// All manifests stored in a repository, oldest first.
    pub async fn list_for_repository(
        executor: &mut PgConnection,
        repository_id: i64,
    ) -> Result<Vec<Manifest>> {
        let mut builder = manifest_select();
        builder
            .and_where(Expr::col((Manifests::Table, Manifests::RepositoryId)).eq(repository_id))
            .order_by((Manifests::Table, Manifests::Id), sea_query::Order::Asc);
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    pub async fn find_many_by_digests(
        executor: &mut PgConnection,
        repository_id: i64,
        digests: &[Digest],
    ) -> Result<Vec<Manifest>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let mut cond = Cond::any();
        for digest in digests {
            cond = cond.add(
                Expr::col((Manifests::Table, Manifests::DigestAlgorithm))
                    .eq(digest.algorithm().id())
                    .and(Expr::col((Manifests::Table, Manifests::Digest)).eq(digest.bytes())),
            );
        }
        let mut builder = manifest_select();
        builder
            .and_where(Expr::col((Manifests::Table, Manifests::RepositoryId)).eq(repository_id))
            .cond_where(cond);
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Manifest, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    /// Insert a manifest row; on digest conflict the existing row id wins.
    async fn create(executor: &mut PgConnection, new: NewManifest<'_>) -> Result<i64> {
        let (cfg_mt, cfg_alg, cfg_digest, cfg_payload) = match &new.configuration {
            Some(c) => (
                Some(c.media_type_id),
                Some(c.digest.algorithm().id()),
                Some(c.digest.bytes()),
                c.payload.map(|p| p.to_vec()),
            ),
            None => (None, None, None, None),
        };
        let (sql, values) = Query::insert()
            .into_table(Manifests::Table)
            .columns([
                Manifests::NamespaceId,
                Manifests::RepositoryId,
                Manifests::SchemaVersion,
                Manifests::MediaTypeId,
                Manifests::DigestAlgorithm,
                Manifests::Digest,
                Manifests::Payload,
                Manifests::ConfigurationMediaTypeId,
                Manifests::ConfigurationBlobDigestAlgorithm,
                Manifests::ConfigurationBlobDigest,
                Manifests::ConfigurationPayload,
            ])
            .values([
                Value::from(new.namespace_id).into(),
                Value::from(new.repository_id).into(),
                Value::from(new.schema_version).into(),
                Value::from(new.media_type_id).into(),
                Value::from(new.digest.algorithm().id()).into(),
                Value::from(new.digest.bytes()).into(),
                Value::from(new.payload.to_vec()).into(),
                Value::from(cfg_mt).into(),
                Value::from(cfg_alg).into(),
                Value::from(cfg_digest).into(),
                Value::from(cfg_payload).into(),
            ])?
            .on_conflict(
                OnConflict::columns([
                    Manifests::RepositoryId,
                    Manifests::DigestAlgorithm,
                    Manifests::Digest,
                ])
                .do_nothing()
                .to_owned(),
            )
            .returning_col(Manifests::Id)
            .build_sqlx(PostgresQueryBuilder);
        if let Some(row) = sqlx::query_with(&sql, values)
            .fetch_optional(&mut *executor)
            .await
            .map_err(map_fk_violation)?
        {
            return Ok(row.try_get("id")?);
        }
        let existing = Self::find_by_digest(executor, new.repository_id, new.digest)
            .await?
            .expect("manifest must exist after conflicting insert");
        Ok(existing.id)
    }

    /// Associate a layer blob; linkage creation also postpones any pending
    /// review of that blob.
    pub async fn insert_layer(
        executor: &mut PgConnection,
        manifest_id: i64,
        digest: &Digest,
        review_delay: Duration,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(ManifestLayers::Table)
            .columns([
                ManifestLayers::ManifestId,
                ManifestLayers::BlobDigestAlgorithm,
                ManifestLayers::BlobDigest,
            ])
            .values([
                Value::from(manifest_id).into(),
                Value::from(digest.algorithm().id()).into(),
                Value::from(digest.bytes()).into(),
            ])?
            .on_conflict(
                OnConflict::columns([
                    ManifestLayers::ManifestId,
                    ManifestLayers::BlobDigestAlgorithm,
                    ManifestLayers::BlobDigest,
                ])
                .do_nothing()
                .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&mut *executor)
            .await
            .map_err(map_fk_violation)?;

        GcBlobTaskStore::queue(executor, digest, "layer_create", review_delay).await
    }

    pub async fn insert_reference(
        executor: &mut PgConnection,
        parent_id: i64,
        child_id: i64,
    ) -> Result<()> {
        if parent_id == child_id {
            return Err(Error::ManifestSelfReference);
        }
        let (sql, values) = Query::insert()
            .into_table(ManifestReferences::Table)
            .columns([ManifestReferences::ParentId, ManifestReferences::ChildId])
            .values([Value::from(parent_id).into(), Value::from(child_id).into()])?
            .on_conflict(
                OnConflict::columns([ManifestReferences::ParentId, ManifestReferences::ChildId])
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(executor)
            .await
            .map_err(map_fk_violation)?;
        Ok(())
    }

    pub async fn layers(executor: &mut PgConnection, manifest_id: i64) -> Result<Vec<Digest>> {
        let (sql, values) = Query::select()
            .from(ManifestLayers::Table)
            .columns([
                ManifestLayers::BlobDigestAlgorithm,
                ManifestLayers::BlobDigest,
            ])
            .and_where(Expr::col(ManifestLayers::ManifestId).eq(manifest_id))
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
        rows.iter()
            .map(|row| {
                Ok(crate::metadata::types::decode_digest(
                    row,
                    "blob_digest_algorithm",
                    "blob_digest",
                )?)
            })
            .collect()
    }

    /// Child manifest ids referenced by a list.
    pub async fn children(executor: &mut PgConnection, manifest_id: i64) -> Result<Vec<i64>> {
        let (sql, values) = Query::select()
            .from(ManifestReferences::Table)
            .column(ManifestReferences::ChildId)
            .and_where(Expr::col(ManifestReferences::ParentId).eq(manifest_id))
            .build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_with(&sql, values).fetch_all(executor).await?;
        rows.iter().map(|row| Ok(row.try_get("child_id")?)).collect()
    }

    /// True when the manifest is a child of any manifest list.
    pub async fn is_referenced(executor: &mut PgConnection, manifest_id: i64) -> Result<bool> {
        let (sql, values) = Query::select()
            .expr_as(
                Expr::exists(
                    Query::select()
                        .expr(Expr::val(1))
                        .from(ManifestReferences::Table)
                        .and_where(Expr::col(ManifestReferences::ChildId).eq(manifest_id))
                        .to_owned(),
                ),
                Alias::new("referenced"),
            )
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;
        Ok(row.try_get("referenced")?)
    }

    /// Delete a manifest row, first enqueueing review work for everything
    /// that may become dangling: each layer blob, the config blob, and each
    /// child manifest. Row cascades take the layer links, references, tags,
    /// and the manifest's own queue entries along.
    pub async fn delete_with_tracking(
        executor: &mut PgConnection,
        manifest: &Manifest,
        review_delay: Duration,
    ) -> Result<()> {
        for layer in Self::layers(executor, manifest.id).await? {
            GcBlobTaskStore::queue(executor, &layer, "layer_delete", review_delay).await?;
        }
        if let Some(config) = &manifest.configuration {
            GcBlobTaskStore::queue(
                executor,
                &config.blob_digest,
                "manifest_delete",
                review_delay,
            )
            .await?;
        }
        for child_id in Self::children(executor, manifest.id).await? {
            GcManifestTaskStore::queue(
                executor,
                manifest.namespace_id,
                manifest.repository_id,
                child_id,
                "manifest_list_delete",
                review_delay,
            )
            .await?;
        }

        let (sql, values) = Query::delete()
            .from_table(Manifests::Table)
            .and_where(Expr::col(Manifests::Id).eq(manifest.id))
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&mut *executor)
            .await
            .map_err(map_fk_violation)?;

        if let Some(config) = &manifest.configuration {
            ConfigurationStore::delete_if_unreferenced(executor, &config.blob_digest).await?;
        }
        Ok(())
    }
}

fn default_review_delay_secs() -> i64 {
    24 * 60 * 60
}

/// Validation and tracking policy for the manifest service.
#[derive(Clone, Debug, Deserialize)]
pub struct ManifestServiceConfig {
    #[serde(default)]
    pub skip_dependency_verification: bool,
    /// Maximum references per manifest; 0 or absent disables the limit.
    #[serde(default)]
    pub reference_limit: Option<usize>,
    #[serde(default)]
    pub url_allow: Option<String>,
    #[serde(default)]
    pub url_deny: Option<String>,
    #[serde(default = "default_review_delay_secs")]
    pub review_delay_secs: i64,
}

impl Default for ManifestServiceConfig {
    fn default() -> Self {
        Self {
            skip_dependency_verification: false,
            reference_limit: None,
            url_allow: None,
            url_deny: None,
            review_delay_secs: default_review_delay_secs(),
        }
    }
}

/// Parses, validates, stores, and retrieves manifests of the supported media
/// types, coordinating the blob service and the metadata store.
#[derive(Clone)]
pub struct ManifestService {
    pool: MetadataPool,
    opts: ValidatorOptions,
    review_delay: Duration,
}

impl ManifestService {
    pub fn new(pool: MetadataPool, config: &ManifestServiceConfig) -> Result<Self> {
        let opts = ValidatorOptions {
            skip_dependency_verification: config.skip_dependency_verification,
            reference_limit: config.reference_limit.filter(|n| *n > 0),
            url_allow: config.url_allow.as_deref().map(Regex::new).transpose()?,
            url_deny: config.url_deny.as_deref().map(Regex::new).transpose()?,
        };
        Ok(Self {
            pool,
            opts,
            review_delay: Duration::seconds(config.review_delay_secs),
        })
    }

    pub fn review_delay(&self) -> Duration {
        self.review_delay
    }

    /// Store a manifest. The digest is computed over the payload exactly as
    /// received; pushing the same payload into the same repository twice is a
    /// no-op that returns the existing row.
    pub async fn put(
        &self,
        blobs: &BlobService,
        repository_path: &str,
        content_type: &str,
        payload: Bytes,
        tag: Option<&str>,
    ) -> Result<Manifest> {
        names::validate_repository_path(repository_path)?;
        let parsed = ManifestPayload::parse(content_type, &payload)?;
        let digest = Digest::from_bytes(&payload);

        let mut tx = self.pool.begin().await?;

        let namespace = NamespaceStore::safe_find_or_create(
            tx.executor()?,
            names::top_level_namespace(repository_path),
        )
        .await?;
        let repository =
            RepositoryStore::safe_find_or_create(tx.executor()?, &namespace, repository_path)
                .await?;

        let manifest = match ManifestStore::find_by_digest(tx.executor()?, repository.id, &digest)
            .await?
        {
            Some(existing) => existing,
            None => {
                let id = match &parsed {
                    ManifestPayload::Image(m) => {
                        self.put_image(
                            &mut tx, blobs, &namespace, &repository, m, content_type, &digest,
                            &payload,
                        )
                        .await?
                    }
                    ManifestPayload::List(l) => {
                        self.put_list(&mut tx, &namespace, &repository, l, content_type, &digest, &payload)
                            .await?
                    }
                    ManifestPayload::Signed(s) => {
                        self.put_signed(&mut tx, &namespace, &repository, s, content_type, &digest, &payload)
                            .await?
                    }
                };
                ManifestStore::find_by_id(tx.executor()?, id)
                    .await?
                    .expect("manifest row must exist after insert")
            }
        };

        if let Some(tag_name) = tag {
            TagStore::upsert(
                tx.executor()?,
                namespace.id,
                repository.id,
                tag_name,
                manifest.id,
                self.review_delay,
            )
            .await?;
        }

        tx.commit().await?;
        tracing::info!(
            repository = repository_path,
            digest = %manifest.digest,
            media_type = %manifest.media_type,
            "manifest stored"
        );
        Ok(manifest)
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_image(
        &self,
        tx: &mut crate::metadata::MetadataTx<'_>,
        blobs: &BlobService,
        namespace: &Namespace,
        repository: &Repository,
        manifest: &ImageManifest,
        content_type: &str,
        digest: &Digest,
        payload: &[u8],
    ) -> Result<i64> {
        let mut errs = VerificationErrors::default();
        validate_image_manifest(manifest, &self.opts, &mut errs)?;

        if !self.opts.skip_dependency_verification {
            let mut required: Vec<Digest> = Vec::with_capacity(1 + manifest.layers.len());
            required.push(manifest.config.digest.clone());
            required.extend(manifest.layers.iter().map(|l| l.digest.clone()));
            self.check_missing_blobs(tx.executor()?, &required, &mut errs)
                .await?;
        }
        errs.into_result()?;

        // the config payload is denormalized onto the manifest row when the
        // blob is readable; a miss only loses the denormalization
        let config_payload = match blobs.get(&manifest.config.digest).await {
            Ok(content) => Some(content.to_vec()),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        ConfigurationStore::safe_find_or_create(
            tx.executor()?,
            &manifest.config.digest,
            &manifest.config.media_type,
            config_payload.as_deref(),
            self.review_delay,
        )
        .await?;

        let media_type_id = MediaTypeStore::safe_find_or_create(tx.executor()?, content_type).await?;
        let config_media_type_id =
            MediaTypeStore::safe_find_or_create(tx.executor()?, &manifest.config.media_type)
                .await?;

        let id = ManifestStore::create(
            tx.executor()?,
            NewManifest {
                namespace_id: namespace.id,
                repository_id: repository.id,
                schema_version: manifest.schema_version as i16,
                media_type_id,
                digest,
                payload,
                configuration: Some(NewConfiguration {
                    media_type_id: config_media_type_id,
                    digest: &manifest.config.digest,
                    payload: config_payload.as_deref(),
                }),
            },
        )
        .await?;

        RepositoryStore::link_blob(tx.executor()?, repository.id, &manifest.config.digest).await?;
        for layer in &manifest.layers {
            ManifestStore::insert_layer(tx.executor()?, id, &layer.digest, self.review_delay)
                .await?;
            RepositoryStore::link_blob(tx.executor()?, repository.id, &layer.digest).await?;
        }
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_list(
        &self,
        tx: &mut crate::metadata::MetadataTx<'_>,
        namespace: &Namespace,
        repository: &Repository,
        list: &ManifestList,
        content_type: &str,
        digest: &Digest,
        payload: &[u8],
    ) -> Result<i64> {
        validate_manifest_list(list, &self.opts)?;
        let media_type_id = MediaTypeStore::safe_find_or_create(tx.executor()?, content_type).await?;

        if likely_buildkit_cache(list) {
            // Buildkit reuses the index format as a container for layer
            // blobs; children are validated and stored as blobs
            let mut errs = VerificationErrors::default();
            if !self.opts.skip_dependency_verification {
                let required: Vec<Digest> =
                    list.manifests.iter().map(|d| d.digest.clone()).collect();
                self.check_missing_blobs(tx.executor()?, &required, &mut errs)
                    .await?;
            }
            errs.into_result()?;

            let id = ManifestStore::create(
                tx.executor()?,
                NewManifest {
                    namespace_id: namespace.id,
                    repository_id: repository.id,
                    schema_version: list.schema_version as i16,
                    media_type_id,
                    digest,
                    payload,
                    configuration: None,
                },
            )
            .await?;
            for child in &list.manifests {
                ManifestStore::insert_layer(tx.executor()?, id, &child.digest, self.review_delay)
                    .await?;
                RepositoryStore::link_blob(tx.executor()?, repository.id, &child.digest).await?;
            }
            return Ok(id);
        }

        // a regular list: every child must already exist as a manifest here
        let child_digests: Vec<Digest> = list.manifests.iter().map(|d| d.digest.clone()).collect();
        let children = if self.opts.skip_dependency_verification {
            ManifestStore::find_many_by_digests(tx.executor()?, repository.id, &child_digests)
                .await?
        } else {
            let found =
                ManifestStore::find_many_by_digests(tx.executor()?, repository.id, &child_digests)
                    .await?;
            let present: HashSet<&Digest> = found.iter().map(|m| &m.digest).collect();
            let mut errs = VerificationErrors::default();
            for digest in &child_digests {
                if !present.contains(digest) {
                    errs.push(VerificationError::ManifestUnknown(digest.clone()));
                }
            }
            errs.into_result()?;
            found
        };

        let id = ManifestStore::create(
            tx.executor()?,
            NewManifest {
                namespace_id: namespace.id,
                repository_id: repository.id,
                schema_version: list.schema_version as i16,
                media_type_id,
                digest,
                payload,
                configuration: None,
            },
        )
        .await?;
        for child in &children {
            ManifestStore::insert_reference(tx.executor()?, id, child.id).await?;
        }
        Ok(id)
    }

    /// Legacy signed schema 1: stored without content validation, with layer
    /// references tracked for the blobs that are known to the registry.
    #[allow(clippy::too_many_arguments)]
    async fn put_signed(
        &self,
        tx: &mut crate::metadata::MetadataTx<'_>,
        namespace: &Namespace,
        repository: &Repository,
        manifest: &SignedManifest,
        content_type: &str,
        digest: &Digest,
        payload: &[u8],
    ) -> Result<i64> {
        let media_type_id = MediaTypeStore::safe_find_or_create(tx.executor()?, content_type).await?;
        let id = ManifestStore::create(
            tx.executor()?,
            NewManifest {
                namespace_id: namespace.id,
                repository_id: repository.id,
                schema_version: manifest.schema_version as i16,
                media_type_id,
                digest,
                payload,
                configuration: None,
            },
        )
        .await?;

        let layer_digests = manifest.layer_digests();
        let known = BlobStore::find_many(tx.executor()?, &layer_digests).await?;
        for blob in &known {
            ManifestStore::insert_layer(tx.executor()?, id, &blob.digest, self.review_delay)
                .await?;
            RepositoryStore::link_blob(tx.executor()?, repository.id, &blob.digest).await?;
        }
        Ok(id)
    }

    async fn check_missing_blobs(
        &self,
        executor: &mut PgConnection,
        required: &[Digest],
        errs: &mut VerificationErrors,
    ) -> Result<()> {
        let found = BlobStore::find_many(executor, required).await?;
        let present: HashSet<&Digest> = found.iter().map(|b| &b.digest).collect();
        for digest in required {
            if !present.contains(digest) {
                errs.push(VerificationError::BlobUnknown(digest.clone()));
            }
        }
        Ok(())
    }

    /// Fetch a manifest by digest or tag.
    pub async fn get(
        &self,
        repository_path: &str,
        reference: &ManifestRef,
    ) -> Result<Manifest> {
        let mut conn = self.pool.conn().await?;
        let repository = RepositoryStore::find_by_path(conn.executor(), repository_path)
            .await?
            .ok_or_else(|| CoreError::RepositoryUnknown(repository_path.to_string()))?;

        let manifest = match reference {
            ManifestRef::Digest(digest) => {
                ManifestStore::find_by_digest(conn.executor(), repository.id, digest).await?
            }
            ManifestRef::Tag(tag) => {
                ManifestStore::find_by_tag(conn.executor(), repository.id, tag).await?
            }
        };
        manifest.ok_or_else(|| CoreError::ManifestUnknown(reference.to_string()).into())
    }

    /// Delete a manifest by digest. Fails when the manifest is still a child
    /// of a manifest list; review tasks are enqueued for everything the
    /// deletion may have orphaned.
    pub async fn delete(&self, repository_path: &str, digest: &Digest) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let repository = RepositoryStore::find_by_path(tx.executor()?, repository_path)
            .await?
            .ok_or_else(|| CoreError::RepositoryUnknown(repository_path.to_string()))?;
        let manifest = ManifestStore::find_by_digest(tx.executor()?, repository.id, digest)
            .await?
            .ok_or_else(|| CoreError::ManifestUnknown(digest.to_string()))?;

        if ManifestStore::is_referenced(tx.executor()?, manifest.id).await? {
            return Err(CoreError::ManifestReferencedInList(digest.clone()).into());
        }

        ManifestStore::delete_with_tracking(tx.executor()?, &manifest, self.review_delay).await?;
        tx.commit().await?;
        tracing::info!(repository = repository_path, %digest, "manifest deleted");
        Ok(())
    }

    /// Point a tag at an already stored manifest.
    pub async fn tag(&self, repository_path: &str, tag: &str, digest: &Digest) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let repository = RepositoryStore::find_by_path(tx.executor()?, repository_path)
            .await?
            .ok_or_else(|| CoreError::RepositoryUnknown(repository_path.to_string()))?;
        let manifest = ManifestStore::find_by_digest(tx.executor()?, repository.id, digest)
            .await?
            .ok_or_else(|| CoreError::ManifestUnknown(digest.to_string()))?;

        TagStore::upsert(
            tx.executor()?,
            repository.namespace_id,
            repository.id,
            tag,
            manifest.id,
            self.review_delay,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_tag(&self, repository_path: &str, tag: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let repository = RepositoryStore::find_by_path(tx.executor()?, repository_path)
            .await?
            .ok_or_else(|| CoreError::RepositoryUnknown(repository_path.to_string()))?;
        let deleted =
            TagStore::delete(tx.executor()?, repository.id, tag, self.review_delay).await?;
        if deleted.is_none() {
            return Err(CoreError::ManifestUnknown(tag.to_string()).into());
        }
        tx.commit().await?;
        Ok(())
    }
}
