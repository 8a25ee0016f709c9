//! Postgres-backed metadata store for the registry core.
//!
//! The relational model tracks repositories, manifests, manifest references,
//! configurations, layer links, and tags, and keeps the two garbage-collection
//! review queues in step with every mutation — the same transaction that
//! creates, switches, or removes a reference upserts the corresponding review
//! task. The online collectors in [`gc`] drain those queues.
pub mod blobs;
pub mod config;
pub mod errors;
pub mod gc;
pub mod manifests;
pub mod metadata;
pub mod repositories;
pub mod tags;

pub use blobs::{BlobStore, ConfigurationStore, MediaTypeStore};
pub use config::{GcConfig, PostgresConfig};
pub use errors::{Error, Result};
pub use gc::{Agent, BlobWorker, GcBlobTaskStore, GcManifestTaskStore, ManifestWorker, Worker};
pub use manifests::{ManifestService, ManifestServiceConfig, ManifestStore};
pub use metadata::{MetadataConn, MetadataPool, MetadataTx};
pub use repositories::{NamespaceStore, RepositoryStore};
pub use tags::TagStore;
