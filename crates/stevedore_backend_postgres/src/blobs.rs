use chrono::Duration;
use sea_query::{Cond, Expr, OnConflict, PostgresQueryBuilder, Query, Value};
use sea_query_binder::SqlxBinder;
use sqlx::{PgConnection, Row};

use stevedore_core::Digest;

use crate::errors::{map_fk_violation, Result};
use crate::gc::queues::GcBlobTaskStore;
use crate::metadata::types::{Blob, Blobs, Configuration, Configurations, MediaTypes};

/// Media-type catalog; rows are created on demand and never deleted.
pub struct MediaTypeStore;

impl MediaTypeStore {
    async fn find(executor: &mut PgConnection, media_type: &str) -> Result<Option<i32>> {
        let (sql, values) = Query::select()
            .from(MediaTypes::Table)
            .column(MediaTypes::Id)
            .and_where(Expr::col(MediaTypes::MediaType).eq(media_type))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&mut *executor)
            .await?;
        row.map(|r| Ok(r.try_get("id")?)).transpose()
    }

    pub async fn safe_find_or_create(
        executor: &mut PgConnection,
        media_type: &str,
    ) -> Result<i32> {
        if let Some(id) = Self::find(executor, media_type).await? {
            return Ok(id);
        }
        let (sql, values) = Query::insert()
            .into_table(MediaTypes::Table)
            .columns([MediaTypes::MediaType])
            .values([Value::from(media_type).into()])?
            .on_conflict(
                OnConflict::column(MediaTypes::MediaType)
                    .do_nothing()
                    .to_owned(),
            )
            .returning_col(MediaTypes::Id)
            .build_sqlx(PostgresQueryBuilder);
        if let Some(row) = sqlx::query_with(&sql, values)
            .fetch_optional(&mut *executor)
            .await?
        {
            return Ok(row.try_get("id")?);
        }
        Ok(Self::find(executor, media_type)
            .await?
            .expect("media type must exist after conflicting insert"))
    }
}

pub struct BlobStore;

impl BlobStore {
    pub async fn find(executor: &mut PgConnection, digest: &Digest) -> Result<Option<Blob>> {
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([
                (Blobs::Table, Blobs::DigestAlgorithm),
                (Blobs::Table, Blobs::Digest),
                (Blobs::Table, Blobs::Size),
                (Blobs::Table, Blobs::CreatedAt),
            ])
            .column((MediaTypes::Table, MediaTypes::MediaType))
            .inner_join(
                MediaTypes::Table,
                Expr::col((Blobs::Table, Blobs::MediaTypeId))
                    .equals((MediaTypes::Table, MediaTypes::Id)),
            )
            .and_where(Expr::col((Blobs::Table, Blobs::DigestAlgorithm)).eq(digest.algorithm().id()))
            .and_where(Expr::col((Blobs::Table, Blobs::Digest)).eq(digest.bytes()))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// Fetch the subset of `digests` that exist, in one round trip. Callers
    /// diff against the request to report every missing dependency at once.
    pub async fn find_many(
        executor: &mut PgConnection,
        digests: &[Digest],
    ) -> Result<Vec<Blob>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let mut cond = Cond::any();
        for digest in digests {
            cond = cond.add(
                Expr::col((Blobs::Table, Blobs::DigestAlgorithm))
                    .eq(digest.algorithm().id())
                    .and(Expr::col((Blobs::Table, Blobs::Digest)).eq(digest.bytes())),
            );
        }
        let (sql, values) = Query::select()
            .from(Blobs::Table)
            .columns([
                (Blobs::Table, Blobs::DigestAlgorithm),
                (Blobs::Table, Blobs::Digest),
                (Blobs::Table, Blobs::Size),
                (Blobs::Table, Blobs::CreatedAt),
            ])
            .column((MediaTypes::Table, MediaTypes::MediaType))
            .inner_join(
                MediaTypes::Table,
                Expr::col((Blobs::Table, Blobs::MediaTypeId))
                    .equals((MediaTypes::Table, MediaTypes::Id)),
            )
            .cond_where(cond)
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    /// Record a blob row after upload finalization. Idempotent per digest;
    /// every creation (re-)enqueues a review task so that a blob uploaded but
    /// never referenced is eventually reclaimed.
    pub async fn safe_create(
        executor: &mut PgConnection,
        digest: &Digest,
        media_type: &str,
        size: i64,
        review_delay: Duration,
    ) -> Result<()> {
        let media_type_id = MediaTypeStore::safe_find_or_create(executor, media_type).await?;
        let (sql, values) = Query::insert()
            .into_table(Blobs::Table)
            .columns([
                Blobs::DigestAlgorithm,
                Blobs::Digest,
                Blobs::MediaTypeId,
                Blobs::Size,
            ])
            .values([
                Value::from(digest.algorithm().id()).into(),
                Value::from(digest.bytes()).into(),
                Value::from(media_type_id).into(),
                Value::from(size).into(),
            ])?
            .on_conflict(
                OnConflict::columns([Blobs::DigestAlgorithm, Blobs::Digest])
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *executor).await?;

        GcBlobTaskStore::queue(executor, digest, "blob_create", review_delay).await
    }

    /// Delete a blob row. Fails with a foreign-key violation when a layer,
    /// configuration, or manifest still references the digest; the queue row
    /// and repository links cascade away with it.
    pub async fn delete(executor: &mut PgConnection, digest: &Digest) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(Blobs::Table)
            .and_where(Expr::col(Blobs::DigestAlgorithm).eq(digest.algorithm().id()))
            .and_where(Expr::col(Blobs::Digest).eq(digest.bytes()))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values)
            .execute(executor)
            .await
            .map_err(map_fk_violation)?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct ConfigurationStore;

impl ConfigurationStore {
    pub async fn find_by_digest(
        executor: &mut PgConnection,
        digest: &Digest,
    ) -> Result<Option<Configuration>> {
        let (sql, values) = Query::select()
            .from(Configurations::Table)
            .columns([
                Configurations::Id,
                Configurations::BlobDigestAlgorithm,
                Configurations::BlobDigest,
                Configurations::MediaTypeId,
                Configurations::Payload,
            ])
            .and_where(
                Expr::col(Configurations::BlobDigestAlgorithm).eq(digest.algorithm().id()),
            )
            .and_where(Expr::col(Configurations::BlobDigest).eq(digest.bytes()))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Configuration, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// Ensure exactly one configuration row per config blob digest. Creation
    /// also tracks the new linkage on the blob's review task.
    pub async fn safe_find_or_create(
        executor: &mut PgConnection,
        digest: &Digest,
        media_type: &str,
        payload: Option<&[u8]>,
        review_delay: Duration,
    ) -> Result<Configuration> {
        if let Some(config) = Self::find_by_digest(executor, digest).await? {
            return Ok(config);
        }

        let media_type_id = MediaTypeStore::safe_find_or_create(executor, media_type).await?;
        let (sql, values) = Query::insert()
            .into_table(Configurations::Table)
            .columns([
                Configurations::BlobDigestAlgorithm,
                Configurations::BlobDigest,
                Configurations::MediaTypeId,
                Configurations::Payload,
            ])
            .values([
                Value::from(digest.algorithm().id()).into(),
                Value::from(digest.bytes()).into(),
                Value::from(media_type_id).into(),
                Value::from(payload.map(|p| p.to_vec())).into(),
            ])?
            .on_conflict(
                OnConflict::columns([
                    Configurations::BlobDigestAlgorithm,
                    Configurations::BlobDigest,
                ])
                .do_nothing()
                .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&mut *executor)
            .await
            .map_err(map_fk_violation)?;

        GcBlobTaskStore::queue(executor, digest, "configuration_create", review_delay).await?;

        Ok(Self::find_by_digest(executor, digest)
            .await?
            .expect("configuration must exist after conflicting insert"))
    }

    /// Drop the configuration row once no manifest embeds the digest any
    /// more. Called from manifest deletion, in the same transaction.
    pub async fn delete_if_unreferenced(
        executor: &mut PgConnection,
        digest: &Digest,
    ) -> Result<bool> {
        use crate::metadata::types::Manifests;

        let embedded = Query::select()
            .expr(Expr::val(1))
            .from(Manifests::Table)
            .and_where(
                Expr::col(Manifests::ConfigurationBlobDigestAlgorithm)
                    .eq(digest.algorithm().id()),
            )
            .and_where(Expr::col(Manifests::ConfigurationBlobDigest).eq(digest.bytes()))
            .to_owned();

        let (sql, values) = Query::delete()
            .from_table(Configurations::Table)
            .and_where(
                Expr::col(Configurations::BlobDigestAlgorithm).eq(digest.algorithm().id()),
            )
            .and_where(Expr::col(Configurations::BlobDigest).eq(digest.bytes()))
            .and_where(Expr::expr(Expr::exists(embedded)).eq(false))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(result.rows_affected() > 0)
    }
}
