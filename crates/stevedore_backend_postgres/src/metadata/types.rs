use chrono::{DateTime, Utc};
use sea_query::Iden;
use sqlx::postgres::PgRow;
use sqlx::Row;

use stevedore_core::{Algorithm, Digest};

/// Decode a digest stored as an (algorithm id, raw hash bytes) column pair.
pub(crate) fn decode_digest(row: &PgRow, alg_col: &str, digest_col: &str) -> sqlx::Result<Digest> {
    let alg: i16 = row.try_get(alg_col)?;
    let bytes: Vec<u8> = row.try_get(digest_col)?;
    Algorithm::from_id(alg)
        .and_then(|a| Digest::from_parts(a, &bytes))
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: digest_col.to_string(),
            source: format!("{e}").into(),
        })
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Namespace {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Iden)]
pub enum TopLevelNamespaces {
    Table,
    Id,
    Name,
    CreatedAt,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Repository {
    pub id: i64,
    pub namespace_id: i64,
    pub name: String,
    pub path: String,
    pub parent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Iden)]
pub enum Repositories {
    Table,
    Id,
    NamespaceId,
    Name,
    Path,
    ParentId,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
pub enum MediaTypes {
    Table,
    Id,
    MediaType,
}

#[derive(Clone, Debug)]
pub struct Blob {
    pub digest: Digest,
    pub media_type: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, PgRow> for Blob {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            digest: decode_digest(row, "digest_algorithm", "digest")?,
            media_type: row.try_get("media_type")?,
            size: row.try_get("size")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Iden)]
pub enum Blobs {
    Table,
    DigestAlgorithm,
    Digest,
    MediaTypeId,
    Size,
    CreatedAt,
}

#[derive(Iden)]
pub enum RepositoryBlobs {
    Table,
    Id,
    RepositoryId,
    BlobDigestAlgorithm,
    BlobDigest,
    CreatedAt,
}

#[derive(Clone, Debug)]
pub struct Configuration {
    pub id: i64,
    pub blob_digest: Digest,
    pub media_type_id: i32,
    pub payload: Option<Vec<u8>>,
}

impl sqlx::FromRow<'_, PgRow> for Configuration {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            blob_digest: decode_digest(row, "blob_digest_algorithm", "blob_digest")?,
            media_type_id: row.try_get("media_type_id")?,
            payload: row.try_get("payload")?,
        })
    }
}

#[derive(Iden)]
pub enum Configurations {
    Table,
    Id,
    BlobDigestAlgorithm,
    BlobDigest,
    MediaTypeId,
    Payload,
    CreatedAt,
}

/// Image configuration carried inline on a manifest row.
#[derive(Clone, Debug)]
pub struct ManifestConfiguration {
    pub media_type: Option<String>,
    pub blob_digest: Digest,
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct Manifest {
    pub id: i64,
    pub namespace_id: i64,
    pub repository_id: i64,
    pub schema_version: i16,
    pub media_type: String,
    pub digest: Digest,
    pub payload: Vec<u8>,
    pub configuration: Option<ManifestConfiguration>,
    pub created_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, PgRow> for Manifest {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let configuration = match row.try_get::<Option<i16>, _>("configuration_blob_digest_algorithm")? {
            Some(_) => Some(ManifestConfiguration {
                media_type: row.try_get("configuration_media_type")?,
                blob_digest: decode_digest(
                    row,
                    "configuration_blob_digest_algorithm",
                    "configuration_blob_digest",
                )?,
                payload: row.try_get("configuration_payload")?,
            }),
            None => None,
        };
        Ok(Self {
            id: row.try_get("id")?,
            namespace_id: row.try_get("namespace_id")?,
            repository_id: row.try_get("repository_id")?,
            schema_version: row.try_get("schema_version")?,
            media_type: row.try_get("media_type")?,
            digest: decode_digest(row, "digest_algorithm", "digest")?,
            payload: row.try_get("payload")?,
            configuration,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Iden)]
pub enum Manifests {
    Table,
    Id,
    NamespaceId,
    RepositoryId,
    SchemaVersion,
    MediaTypeId,
    DigestAlgorithm,
    Digest,
    Payload,
    ConfigurationMediaTypeId,
    ConfigurationBlobDigestAlgorithm,
    ConfigurationBlobDigest,
    ConfigurationPayload,
    CreatedAt,
}

#[derive(Iden)]
pub enum ManifestReferences {
    Table,
    Id,
    ParentId,
    ChildId,
    CreatedAt,
}

#[derive(Iden)]
pub enum ManifestLayers {
    Table,
    Id,
    ManifestId,
    BlobDigestAlgorithm,
    BlobDigest,
    CreatedAt,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub namespace_id: i64,
    pub repository_id: i64,
    pub name: String,
    pub manifest_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Iden)]
pub enum Tags {
    Table,
    Id,
    NamespaceId,
    RepositoryId,
    Name,
    ManifestId,
    CreatedAt,
    UpdatedAt,
}

#[derive(Clone, Debug)]
pub struct GcBlobTask {
    pub digest: Digest,
    pub review_after: DateTime<Utc>,
    pub review_count: i32,
    pub created_at: DateTime<Utc>,
    pub event: String,
}

impl sqlx::FromRow<'_, PgRow> for GcBlobTask {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            digest: decode_digest(row, "digest_algorithm", "digest")?,
            review_after: row.try_get("review_after")?,
            review_count: row.try_get("review_count")?,
            created_at: row.try_get("created_at")?,
            event: row.try_get("event")?,
        })
    }
}

#[derive(Iden)]
pub enum GcBlobReviewQueue {
    Table,
    DigestAlgorithm,
    Digest,
    ReviewAfter,
    ReviewCount,
    CreatedAt,
    Event,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct GcManifestTask {
    pub namespace_id: i64,
    pub repository_id: i64,
    pub manifest_id: i64,
    pub review_after: DateTime<Utc>,
    pub review_count: i32,
    pub created_at: DateTime<Utc>,
    pub event: String,
}

#[derive(Iden)]
pub enum GcManifestReviewQueue {
    Table,
    NamespaceId,
    RepositoryId,
    ManifestId,
    ReviewAfter,
    ReviewCount,
    CreatedAt,
    Event,
}
