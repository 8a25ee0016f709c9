//! The two review queues and their locking disciplines.
//!
//! Queue rows are written by the same transactions that mutate the tracked
//! entities (the application-code equivalent of database triggers), with an
//! upsert that postpones rather than resets: on conflict `review_after` moves
//! to `GREATEST(existing, proposed)` and `review_count` is preserved, so a
//! tight write loop on one digest cannot starve the collector.
use chrono::{DateTime, Duration, Utc};
use sea_query::{
    Alias, Expr, LockBehavior, LockType, OnConflict, Order, PostgresQueryBuilder, Query,
    SelectStatement, Value,
};
use sea_query_binder::SqlxBinder;
use sqlx::{PgConnection, Row};

use stevedore_core::Digest;

use crate::errors::Result;
use crate::metadata::types::{
    Configurations, GcBlobReviewQueue, GcBlobTask, GcManifestReviewQueue, GcManifestTask,
    ManifestLayers, ManifestReferences, Manifests, RepositoryBlobs, Tags,
};

pub struct GcBlobTaskStore;

impl GcBlobTaskStore {
    /// Upsert a review task for a digest. `event` names the mutation that
    /// triggered the review.
    pub async fn queue(
        executor: &mut PgConnection,
        digest: &Digest,
        event: &str,
        delay: Duration,
    ) -> Result<()> {
        let due = Utc::now() + delay;
        let (sql, values) = Query::insert()
            .into_table(GcBlobReviewQueue::Table)
            .columns([
                GcBlobReviewQueue::DigestAlgorithm,
                GcBlobReviewQueue::Digest,
                GcBlobReviewQueue::ReviewAfter,
                GcBlobReviewQueue::Event,
            ])
            .values([
                Value::from(digest.algorithm().id()).into(),
                Value::from(digest.bytes()).into(),
                Value::from(due).into(),
                Value::from(event).into(),
            ])?
            .on_conflict(
                OnConflict::columns([
                    GcBlobReviewQueue::DigestAlgorithm,
                    GcBlobReviewQueue::Digest,
                ])
                .value(
                    GcBlobReviewQueue::ReviewAfter,
                    Expr::cust(
                        r#"GREATEST("gc_blob_review_queue"."review_after", "excluded"."review_after")"#,
                    ),
                )
                .value(GcBlobReviewQueue::Event, Expr::cust(r#""excluded"."event""#))
                .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    fn select_columns(builder: &mut SelectStatement) {
        builder.from(GcBlobReviewQueue::Table).columns([
            GcBlobReviewQueue::DigestAlgorithm,
            GcBlobReviewQueue::Digest,
            GcBlobReviewQueue::ReviewAfter,
            GcBlobReviewQueue::ReviewCount,
            GcBlobReviewQueue::CreatedAt,
            GcBlobReviewQueue::Event,
        ]);
    }

    /// The earliest-due unlocked task, skipping tasks held by concurrent
    /// workers. Ties on `review_after` break by insertion order.
    pub async fn next(executor: &mut PgConnection) -> Result<Option<GcBlobTask>> {
        let mut builder = Query::select();
        Self::select_columns(&mut builder);
        builder
            .and_where(Expr::col(GcBlobReviewQueue::ReviewAfter).lte(Expr::cust("now()")))
            .order_by(GcBlobReviewQueue::ReviewAfter, Order::Asc)
            .order_by(GcBlobReviewQueue::CreatedAt, Order::Asc)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .limit(1);
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, GcBlobTask, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// Lock one specific task; blocks behind a worker that holds it.
    pub async fn find_and_lock(
        executor: &mut PgConnection,
        digest: &Digest,
    ) -> Result<Option<GcBlobTask>> {
        let mut builder = Query::select();
        Self::select_columns(&mut builder);
        builder
            .and_where(Expr::col(GcBlobReviewQueue::DigestAlgorithm).eq(digest.algorithm().id()))
            .and_where(Expr::col(GcBlobReviewQueue::Digest).eq(digest.bytes()))
            .lock(LockType::Update);
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, GcBlobTask, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// Push the task out by `delay` and bump its review count. Returns the
    /// updated `(review_after, review_count)` when the task still exists.
    pub async fn postpone(
        executor: &mut PgConnection,
        digest: &Digest,
        delay: Duration,
    ) -> Result<Option<(DateTime<Utc>, i32)>> {
        let (sql, values) = Query::update()
            .table(GcBlobReviewQueue::Table)
            .value(
                GcBlobReviewQueue::ReviewAfter,
                Expr::cust_with_values(
                    r#""review_after" + make_interval(secs => ?)"#,
                    [delay.num_seconds() as f64],
                ),
            )
            .value(
                GcBlobReviewQueue::ReviewCount,
                Expr::col(GcBlobReviewQueue::ReviewCount).add(1),
            )
            .and_where(Expr::col(GcBlobReviewQueue::DigestAlgorithm).eq(digest.algorithm().id()))
            .and_where(Expr::col(GcBlobReviewQueue::Digest).eq(digest.bytes()))
            .returning(Query::returning().columns([
                GcBlobReviewQueue::ReviewAfter,
                GcBlobReviewQueue::ReviewCount,
            ]))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(executor)
            .await?;
        row.map(|r| Ok((r.try_get("review_after")?, r.try_get("review_count")?)))
            .transpose()
    }

    pub async fn delete(executor: &mut PgConnection, digest: &Digest) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(GcBlobReviewQueue::Table)
            .and_where(Expr::col(GcBlobReviewQueue::DigestAlgorithm).eq(digest.algorithm().id()))
            .and_where(Expr::col(GcBlobReviewQueue::Digest).eq(digest.bytes()))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(result.rows_affected() > 0)
    }

    /// A blob is dangling when nothing references its digest: no repository
    /// link, no manifest layer, no configuration row, and no manifest with
    /// the digest embedded as its configuration. Evaluated on the worker's
    /// transaction so the verdict is atomic with the delete.
    pub async fn is_dangling(executor: &mut PgConnection, digest: &Digest) -> Result<bool> {
        let alg = digest.algorithm().id();
        let bytes = digest.bytes();

        let (sql, values) = Query::select()
            .expr_as(
                Expr::exists(digest_ref_exists(
                    RepositoryBlobs::Table,
                    RepositoryBlobs::BlobDigestAlgorithm,
                    RepositoryBlobs::BlobDigest,
                    alg,
                    bytes.clone(),
                )),
                Alias::new("linked"),
            )
            .expr_as(
                Expr::exists(digest_ref_exists(
                    ManifestLayers::Table,
                    ManifestLayers::BlobDigestAlgorithm,
                    ManifestLayers::BlobDigest,
                    alg,
                    bytes.clone(),
                )),
                Alias::new("layered"),
            )
            .expr_as(
                Expr::exists(digest_ref_exists(
                    Configurations::Table,
                    Configurations::BlobDigestAlgorithm,
                    Configurations::BlobDigest,
                    alg,
                    bytes.clone(),
                )),
                Alias::new("configured"),
            )
            .expr_as(
                Expr::exists(digest_ref_exists(
                    Manifests::Table,
                    Manifests::ConfigurationBlobDigestAlgorithm,
                    Manifests::ConfigurationBlobDigest,
                    alg,
                    bytes,
                )),
                Alias::new("embedded"),
            )
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values).fetch_one(executor).await?;
        let referenced: bool = row.try_get::<bool, _>("linked")?
            || row.try_get::<bool, _>("layered")?
            || row.try_get::<bool, _>("configured")?
            || row.try_get::<bool, _>("embedded")?;
        Ok(!referenced)
    }
}

/// `SELECT 1 FROM <table> WHERE <alg col> = $1 AND <digest col> = $2`, for
/// use inside `EXISTS`.
fn digest_ref_exists<T, C>(
    table: T,
    alg_col: C,
    digest_col: C,
    alg: i16,
    bytes: Vec<u8>,
) -> SelectStatement
where
    T: sea_query::IntoTableRef,
    C: sea_query::IntoColumnRef,
{
    Query::select()
        .expr(Expr::val(1))
        .from(table)
        .and_where(Expr::col(alg_col).eq(alg))
        .and_where(Expr::col(digest_col).eq(bytes))
        .to_owned()
}

pub struct GcManifestTaskStore;

impl GcManifestTaskStore {
    pub async fn queue(
        executor: &mut PgConnection,
        namespace_id: i64,
        repository_id: i64,
        manifest_id: i64,
        event: &str,
        delay: Duration,
    ) -> Result<()> {
        let due = Utc::now() + delay;
        let (sql, values) = Query::insert()
            .into_table(GcManifestReviewQueue::Table)
            .columns([
                GcManifestReviewQueue::NamespaceId,
                GcManifestReviewQueue::RepositoryId,
                GcManifestReviewQueue::ManifestId,
                GcManifestReviewQueue::ReviewAfter,
                GcManifestReviewQueue::Event,
            ])
            .values([
                Value::from(namespace_id).into(),
                Value::from(repository_id).into(),
                Value::from(manifest_id).into(),
                Value::from(due).into(),
                Value::from(event).into(),
            ])?
            .on_conflict(
                OnConflict::columns([
                    GcManifestReviewQueue::NamespaceId,
                    GcManifestReviewQueue::RepositoryId,
                    GcManifestReviewQueue::ManifestId,
                ])
                .value(
                    GcManifestReviewQueue::ReviewAfter,
                    Expr::cust(
                        r#"GREATEST("gc_manifest_review_queue"."review_after", "excluded"."review_after")"#,
                    ),
                )
                .value(
                    GcManifestReviewQueue::Event,
                    Expr::cust(r#""excluded"."event""#),
                )
                .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(())
    }

    fn select_columns(builder: &mut SelectStatement) {
        builder.from(GcManifestReviewQueue::Table).columns([
            GcManifestReviewQueue::NamespaceId,
            GcManifestReviewQueue::RepositoryId,
            GcManifestReviewQueue::ManifestId,
            GcManifestReviewQueue::ReviewAfter,
            GcManifestReviewQueue::ReviewCount,
            GcManifestReviewQueue::CreatedAt,
            GcManifestReviewQueue::Event,
        ]);
    }

    pub async fn next(executor: &mut PgConnection) -> Result<Option<GcManifestTask>> {
        let mut builder = Query::select();
        Self::select_columns(&mut builder);
        builder
            .and_where(Expr::col(GcManifestReviewQueue::ReviewAfter).lte(Expr::cust("now()")))
            .order_by(GcManifestReviewQueue::ReviewAfter, Order::Asc)
            .order_by(GcManifestReviewQueue::CreatedAt, Order::Asc)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .limit(1);
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, GcManifestTask, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn find_and_lock(
        executor: &mut PgConnection,
        namespace_id: i64,
        repository_id: i64,
        manifest_id: i64,
    ) -> Result<Option<GcManifestTask>> {
        let mut builder = Query::select();
        Self::select_columns(&mut builder);
        builder
            .and_where(Expr::col(GcManifestReviewQueue::NamespaceId).eq(namespace_id))
            .and_where(Expr::col(GcManifestReviewQueue::RepositoryId).eq(repository_id))
            .and_where(Expr::col(GcManifestReviewQueue::ManifestId).eq(manifest_id))
            .lock(LockType::Update);
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, GcManifestTask, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    pub async fn postpone(
        executor: &mut PgConnection,
        task: &GcManifestTask,
        delay: Duration,
    ) -> Result<Option<(DateTime<Utc>, i32)>> {
        let (sql, values) = Query::update()
            .table(GcManifestReviewQueue::Table)
            .value(
                GcManifestReviewQueue::ReviewAfter,
                Expr::cust_with_values(
                    r#""review_after" + make_interval(secs => ?)"#,
                    [delay.num_seconds() as f64],
                ),
            )
            .value(
                GcManifestReviewQueue::ReviewCount,
                Expr::col(GcManifestReviewQueue::ReviewCount).add(1),
            )
            .and_where(Expr::col(GcManifestReviewQueue::NamespaceId).eq(task.namespace_id))
            .and_where(Expr::col(GcManifestReviewQueue::RepositoryId).eq(task.repository_id))
            .and_where(Expr::col(GcManifestReviewQueue::ManifestId).eq(task.manifest_id))
            .returning(Query::returning().columns([
                GcManifestReviewQueue::ReviewAfter,
                GcManifestReviewQueue::ReviewCount,
            ]))
            .build_sqlx(PostgresQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_optional(executor)
            .await?;
        row.map(|r| Ok((r.try_get("review_after")?, r.try_get("review_count")?)))
            .transpose()
    }

    pub async fn delete(executor: &mut PgConnection, task: &GcManifestTask) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(GcManifestReviewQueue::Table)
            .and_where(Expr::col(GcManifestReviewQueue::NamespaceId).eq(task.namespace_id))
            .and_where(Expr::col(GcManifestReviewQueue::RepositoryId).eq(task.repository_id))
            .and_where(Expr::col(GcManifestReviewQueue::ManifestId).eq(task.manifest_id))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(result.rows_affected() > 0)
    }

    /// A manifest is dangling when it has no tags and is not a child of any
    /// manifest list. Evaluated on the worker's transaction.
    pub async fn is_dangling(executor: &mut PgConnection, manifest_id: i64) -> Result<bool> {
        let (sql, values) = Query::select()
            .expr_as(
                Expr::exists(
                    Query::select()
                        .expr(Expr::val(1))
                        .from(Tags::Table)
                        .and_where(Expr::col(Tags::ManifestId).eq(manifest_id))
                        .to_owned(),
                ),
                Alias::new("tagged"),
            )
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
        Ok(!(row.try_get::<bool, _>("tagged")? || row.try_get::<bool, _>("referenced")?))
    }
}
