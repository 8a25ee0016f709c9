//! Online garbage collection: review queues and the workers that drain them.
pub mod backoff;
pub mod queues;
pub mod worker;

pub use queues::{GcBlobTaskStore, GcManifestTaskStore};
pub use worker::{Agent, BlobWorker, ManifestWorker, Worker};
