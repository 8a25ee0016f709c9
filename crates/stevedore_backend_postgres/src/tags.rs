use chrono::Duration;
use sea_query::{Expr, LockType, OnConflict, Order, PostgresQueryBuilder, Query, Value};
use sea_query_binder::SqlxBinder;
use sqlx::PgConnection;

use stevedore_core::names;

use crate::errors::{map_fk_violation, Result};
use crate::gc::queues::GcManifestTaskStore;
use crate::metadata::types::{Tag, Tags};

const TAG_COLUMNS: [Tags; 7] = [
    Tags::Id,
    Tags::NamespaceId,
    Tags::RepositoryId,
    Tags::Name,
    Tags::ManifestId,
    Tags::CreatedAt,
    Tags::UpdatedAt,
];

pub struct TagStore;

impl TagStore {
    pub async fn find(
        executor: &mut PgConnection,
        repository_id: i64,
        name: &str,
    ) -> Result<Option<Tag>> {
        let (sql, values) = Query::select()
            .from(Tags::Table)
            .columns(TAG_COLUMNS)
            .and_where(Expr::col(Tags::RepositoryId).eq(repository_id))
            .and_where(Expr::col(Tags::Name).eq(name))
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    async fn find_for_update(
        executor: &mut PgConnection,
        repository_id: i64,
        name: &str,
    ) -> Result<Option<Tag>> {
        let (sql, values) = Query::select()
            .from(Tags::Table)
            .columns(TAG_COLUMNS)
            .and_where(Expr::col(Tags::RepositoryId).eq(repository_id))
            .and_where(Expr::col(Tags::Name).eq(name))
            .lock(LockType::Update)
            .build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_optional(executor)
            .await?)
    }

    /// Tags in a repository ordered by name, with keyset pagination.
    pub async fn list(
        executor: &mut PgConnection,
        repository_id: i64,
        n: Option<i64>,
        last: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let mut builder = Query::select();
        builder
            .from(Tags::Table)
            .columns(TAG_COLUMNS)
            .and_where(Expr::col(Tags::RepositoryId).eq(repository_id))
            .order_by(Tags::Name, Order::Asc);
        if let Some(last) = last {
            builder.and_where(Expr::col(Tags::Name).gt(last));
        }
        if let Some(n) = n {
            builder.limit(n as u64);
        }
        let (sql, values) = builder.build_sqlx(PostgresQueryBuilder);
        Ok(sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_all(executor)
            .await?)
    }

    /// Point `name` at `manifest_id`, creating or retargeting the tag. When
    /// the tag moves off a different manifest, that manifest goes onto the
    /// review queue — it may have just lost its last reference. Returns the
    /// replaced manifest id, if any.
    pub async fn upsert(
        executor: &mut PgConnection,
        namespace_id: i64,
        repository_id: i64,
        name: &str,
        manifest_id: i64,
        review_delay: Duration,
    ) -> Result<Option<i64>> {
        names::validate_tag(name)?;

        let previous = Self::find_for_update(executor, repository_id, name).await?;

        let (sql, values) = Query::insert()
            .into_table(Tags::Table)
            .columns([
                Tags::NamespaceId,
                Tags::RepositoryId,
                Tags::Name,
                Tags::ManifestId,
            ])
            .values([
                Value::from(namespace_id).into(),
                Value::from(repository_id).into(),
                Value::from(name).into(),
                Value::from(manifest_id).into(),
            ])?
            .on_conflict(
                OnConflict::columns([Tags::RepositoryId, Tags::Name])
                    .value(
                        Tags::ManifestId,
                        Expr::cust(r#""excluded"."manifest_id""#),
                    )
                    .value(Tags::UpdatedAt, Expr::cust("now()"))
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values)
            .execute(&mut *executor)
            .await
            .map_err(map_fk_violation)?;

        match previous {
            Some(old) if old.manifest_id != manifest_id => {
                GcManifestTaskStore::queue(
                    executor,
                    old.namespace_id,
                    old.repository_id,
                    old.manifest_id,
                    "tag_switch",
                    review_delay,
                )
                .await?;
                Ok(Some(old.manifest_id))
            }
            _ => Ok(None),
        }
    }

    /// Delete a tag; the manifest it pointed at goes onto the review queue.
    pub async fn delete(
        executor: &mut PgConnection,
        repository_id: i64,
        name: &str,
        review_delay: Duration,
    ) -> Result<Option<Tag>> {
        let (sql, values) = Query::delete()
            .from_table(Tags::Table)
            .and_where(Expr::col(Tags::RepositoryId).eq(repository_id))
            .and_where(Expr::col(Tags::Name).eq(name))
            .returning(Query::returning().columns(TAG_COLUMNS))
            .build_sqlx(PostgresQueryBuilder);
        let deleted = sqlx::query_as_with::<_, Tag, _>(&sql, values)
            .fetch_optional(&mut *executor)
            .await?;

        if let Some(tag) = &deleted {
            GcManifestTaskStore::queue(
                executor,
                tag.namespace_id,
                tag.repository_id,
                tag.manifest_id,
                "tag_delete",
                review_delay,
            )
            .await?;
        }
        Ok(deleted)
    }
}
