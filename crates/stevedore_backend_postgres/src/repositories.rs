use sea_query::{Expr, OnConflict, PostgresQueryBuilder, Query, Value};
use sea_query_binder::SqlxBinder;
use sqlx::PgConnection;

use stevedore_core::names;
use stevedore_core::{Digest, Error as CoreError};

use crate::errors::{map_fk_violation, Result};
use crate::metadata::types::{
    Blob, Blobs, MediaTypes, Namespace, Repositories, Repository, RepositoryBlobs,
    TopLevelNamespaces,
};

/// Top-level namespace rows, one per first path segment.
pub struct NamespaceStore;

impl NamespaceStore {
    pub async fn find_by_name(
        executor: &mut PgConnection,
        name: &str,
    ) -> Result<Option<Namespace>> {
        let (sql, values) = Query::select()
            .from(TopLevelNamespaces::Table)
            .columns([
                TopLevelNamespaces::Id,
                TopLevelNamespaces::Name,
                TopLevelNamespaces::CreatedAt,
            ])
            .and_where(Expr::col(TopLevelNamespaces::Name).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Namespace, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// Find-or-create that never blocks on the hot path: a plain read first,
    /// then `INSERT … ON CONFLICT DO NOTHING RETURNING`, then a re-read for
    /// the case where a concurrent creator won the race.
    pub async fn safe_find_or_create(
        executor: &mut PgConnection,
        name: &str,
    ) -> Result<Namespace> {
        if let Some(ns) = Self::find_by_name(executor, name).await? {
            return Ok(ns);
        }

        let (sql, values) = Query::insert()
            .into_table(TopLevelNamespaces::Table)
            .columns([TopLevelNamespaces::Name])
            .values([Value::from(name).into()])?
            .on_conflict(
                OnConflict::column(TopLevelNamespaces::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .returning_all()
            .build_sqlx(PostgresQueryBuilder);
        if let Some(ns) = sqlx::query_as_with::<_, Namespace, _>(&sql, values)
            .fetch_optional(&mut *executor)
            .await?
        {
            return Ok(ns);
        }

        // lost the race; the winner's row is visible now
        Ok(Self::find_by_name(executor, name)
            .await?
            .expect("namespace must exist after conflicting insert"))
    }
}

pub struct RepositoryStore;

impl RepositoryStore {
    pub async fn find_by_path(
        executor: &mut PgConnection,
        path: &str,
    ) -> Result<Option<Repository>> {
        let (sql, values) = Query::select()
            .from(Repositories::Table)
            .columns([
                Repositories::Id,
                Repositories::NamespaceId,
                Repositories::Name,
                Repositories::Path,
                Repositories::ParentId,
                Repositories::CreatedAt,
                Repositories::UpdatedAt,
            ])
            .and_where(Expr::col(Repositories::Path).eq(path))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Repository, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// Idempotent create by path. Ancestor repositories are created on the
    /// way down so that `parent_id` always chains to the namespace root;
    /// concurrent creators are resolved with the conflict-then-re-read dance.
    pub async fn safe_find_or_create(
        executor: &mut PgConnection,
        namespace: &Namespace,
        path: &str,
    ) -> Result<Repository> {
        names::validate_repository_path(path)?;

        let mut parent_id: Option<i64> = None;
        let mut current = String::new();
        let mut repository = None;
        for segment in path.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            let repo =
                Self::create_segment(executor, namespace, segment, &current, parent_id).await?;
            parent_id = Some(repo.id);
            repository = Some(repo);
        }
        Ok(repository.ok_or(CoreError::RepositoryNameInvalid(path.to_string()))?)
    }

    async fn create_segment(
        executor: &mut PgConnection,
        namespace: &Namespace,
        name: &str,
        path: &str,
        parent_id: Option<i64>,
    ) -> Result<Repository> {
        if let Some(repo) = Self::find_by_path(executor, path).await? {
            return Ok(repo);
        }

        let (sql, values) = Query::insert()
            .into_table(Repositories::Table)
            .columns([
                Repositories::NamespaceId,
                Repositories::Name,
                Repositories::Path,
                Repositories::ParentId,
            ])
            .values([
                Value::from(namespace.id).into(),
                Value::from(name).into(),
                Value::from(path).into(),
                Value::from(parent_id).into(),
            ])?
            .on_conflict(OnConflict::column(Repositories::Path).do_nothing().to_owned())
            .returning_all()
            .build_sqlx(PostgresQueryBuilder);
        if let Some(repo) = sqlx::query_as_with::<_, Repository, _>(&sql, values)
            .fetch_optional(&mut *executor)
            .await?
        {
            return Ok(repo);
        }

        Ok(Self::find_by_path(executor, path)
            .await?
            .expect("repository must exist after conflicting insert"))
    }

    /// Make a globally stored blob visible in this repository.
    pub async fn link_blob(
        executor: &mut PgConnection,
        repository_id: i64,
        digest: &Digest,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(RepositoryBlobs::Table)
            .columns([
                RepositoryBlobs::RepositoryId,
                RepositoryBlobs::BlobDigestAlgorithm,
                RepositoryBlobs::BlobDigest,
            ])
            .values([
                Value::from(repository_id).into(),
                Value::from(digest.algorithm().id()).into(),
                Value::from(digest.bytes()).into(),
            ])?
            .on_conflict(
                OnConflict::columns([
                    RepositoryBlobs::RepositoryId,
                    RepositoryBlobs::BlobDigestAlgorithm,
                    RepositoryBlobs::BlobDigest,
                ])
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

    pub async fn unlink_blob(
        executor: &mut PgConnection,
        repository_id: i64,
        digest: &Digest,
    ) -> Result<bool> {
        let (sql, values) = Query::delete()
            .from_table(RepositoryBlobs::Table)
            .and_where(Expr::col(RepositoryBlobs::RepositoryId).eq(repository_id))
            .and_where(Expr::col(RepositoryBlobs::BlobDigestAlgorithm).eq(digest.algorithm().id()))
            .and_where(Expr::col(RepositoryBlobs::BlobDigest).eq(digest.bytes()))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(executor).await?;
        Ok(result.rows_affected() > 0)
    }

    /// All blobs linked into a repository.
    pub async fn blobs(executor: &mut PgConnection, repository_id: i64) -> Result<Vec<Blob>> {
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
            .inner_join(
                RepositoryBlobs::Table,
                Expr::col((RepositoryBlobs::Table, RepositoryBlobs::BlobDigestAlgorithm))
                    .equals((Blobs::Table, Blobs::DigestAlgorithm))
                    .and(
                        Expr::col((RepositoryBlobs::Table, RepositoryBlobs::BlobDigest))
                            .equals((Blobs::Table, Blobs::Digest)),
                    ),
            )
            .and_where(
                Expr::col((RepositoryBlobs::Table, RepositoryBlobs::RepositoryId))
                    .eq(repository_id),
            )
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Blob, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }
}
