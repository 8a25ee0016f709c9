//! GC worker skeleton shared by the blob and manifest collectors.
//!
//! Each `run_once` processes at most one due task inside a single transaction
//! with an absolute deadline: dequeue with `SKIP LOCKED`, decide danglingness
//! on the same transaction, then either delete the target (cascades remove
//! the task) or delete the task alone. Transient failures are surfaced
//! without postponing — the task is still due and the next poll retries it;
//! anything else re-locks the task and pushes it out by an exponential
//! backoff. A panic rolls the transaction back (by dropping it), is reported,
//! and re-raised.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use uuid::Uuid;

use stevedore_storage::{PathBuilder, StorageDriver};

use crate::blobs::BlobStore;
use crate::config::GcConfig;
use crate::errors::{Error, Result};
use crate::gc::backoff::exponential_backoff;
use crate::gc::queues::{GcBlobTaskStore, GcManifestTaskStore};
use crate::manifests::ManifestStore;
use crate::metadata::types::{GcBlobTask, GcManifestTask};
use crate::metadata::MetadataPool;

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process at most one due task. Returns whether a task was found.
    async fn run_once(&self) -> Result<bool>;
}

/// Drives a worker on a polling loop, draining the queue whenever tasks are
/// found and sleeping only when it runs dry or errors.
pub struct Agent<W: Worker> {
    worker: W,
    interval: Duration,
}

impl<W: Worker> Agent<W> {
    pub fn new(worker: W, config: &GcConfig) -> Self {
        Self {
            worker,
            interval: config.poll_interval(),
        }
    }

    pub async fn run(&self) {
        tracing::info!(worker = self.worker.name(), "gc agent started");
        loop {
            match self.worker.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.interval).await,
                Err(e) => {
                    tracing::error!(worker = self.worker.name(), error = %e, "gc run failed");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

type TaskResult<T> = std::result::Result<bool, (Error, Option<T>)>;

/// Run `process` under the worker deadline and panic barrier, then apply the
/// shared error policy via `postpone`.
async fn run_guarded<T, F, P>(
    worker: &'static str,
    tx_timeout: Duration,
    process: F,
    postpone: P,
) -> Result<bool>
where
    F: std::future::Future<Output = TaskResult<T>>,
    P: FnOnce(T) -> futures::future::BoxFuture<'static, ()>,
{
    let correlation_id = Uuid::new_v4();
    let outcome = tokio::time::timeout(tx_timeout, AssertUnwindSafe(process).catch_unwind()).await;

    match outcome {
        Err(_) => {
            // deadline expired mid-transaction; dropping it released the row
            // locks, and the task is still due on the next poll
            tracing::warn!(worker, %correlation_id, "gc transaction deadline exceeded");
            Err(Error::TxDeadlineExceeded)
        }
        Ok(Err(panic)) => {
            tracing::error!(worker, %correlation_id, "gc worker panicked; transaction rolled back");
            std::panic::resume_unwind(panic)
        }
        Ok(Ok(Ok(found))) => Ok(found),
        Ok(Ok(Err((e, task)))) => {
            if !e.is_transient() {
                if let Some(task) = task {
                    postpone(task).await;
                }
            }
            tracing::warn!(worker, %correlation_id, error = %e, "gc task processing failed");
            Err(e)
        }
    }
}

/// Reclaims blobs whose review tasks came due and that nothing references.
#[derive(Clone)]
pub struct BlobWorker {
    pool: MetadataPool,
    driver: Arc<dyn StorageDriver>,
    paths: PathBuilder,
    config: GcConfig,
}

impl BlobWorker {
    pub fn new(
        pool: MetadataPool,
        driver: Arc<dyn StorageDriver>,
        paths: PathBuilder,
        config: GcConfig,
    ) -> Self {
        Self {
            pool,
            driver,
            paths,
            config,
        }
    }

    async fn process(&self) -> TaskResult<GcBlobTask> {
        let mut tx = self.pool.begin().await.map_err(|e| (e, None))?;
        let task = match next_or_rollback(
            GcBlobTaskStore::next(tx.executor().map_err(|e| (e, None))?).await,
            &mut tx,
        )
        .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(false),
            Err(e) => return Err((e, None)),
        };

        tracing::info!(
            digest = %task.digest,
            review_after = %task.review_after,
            review_count = task.review_count,
            event = %task.event,
            "processing blob review task"
        );

        let delete_storage = match self.process_task(&mut tx, &task).await {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err((e, Some(task)));
            }
        };
        if let Err(e) = tx.commit().await {
            return Err((e, Some(task)));
        }

        if delete_storage {
            // the committed row deletion is the point of no return; a failed
            // storage delete leaves an orphan object that the offline sweep
            // can re-detect
            let path = self.paths.blob_path(&task.digest);
            match self.driver.delete(&path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(digest = %task.digest, error = %e, "blob storage deletion failed");
                }
            }
            tracing::info!(digest = %task.digest, "dangling blob deleted");
        }
        Ok(true)
    }

    async fn process_task(
        &self,
        tx: &mut crate::metadata::MetadataTx<'_>,
        task: &GcBlobTask,
    ) -> Result<bool> {
        if GcBlobTaskStore::is_dangling(tx.executor()?, &task.digest).await? {
            // cascades remove the task row
            BlobStore::delete(tx.executor()?, &task.digest).await?;
            Ok(true)
        } else {
            GcBlobTaskStore::delete(tx.executor()?, &task.digest).await?;
            Ok(false)
        }
    }

    async fn postpone(&self, task: GcBlobTask) {
        let delay = exponential_backoff(task.review_count);
        let result: Result<()> = async {
            let mut tx = self.pool.begin().await?;
            if let Some(locked) =
                GcBlobTaskStore::find_and_lock(tx.executor()?, &task.digest).await?
            {
                // only postpone when no other worker advanced it already
                if locked.review_after <= task.review_after {
                    if let Some((review_after, review_count)) =
                        GcBlobTaskStore::postpone(tx.executor()?, &task.digest, delay).await?
                    {
                        tracing::info!(
                            digest = %task.digest,
                            review_after = %review_after,
                            review_count,
                            "blob review task postponed"
                        );
                    }
                }
            }
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(digest = %task.digest, error = %e, "failed to postpone blob review task");
        }
    }
}

#[async_trait]
impl Worker for BlobWorker {
    fn name(&self) -> &'static str {
        "gc-blob-worker"
    }

    async fn run_once(&self) -> Result<bool> {
        run_guarded(
            self.name(),
            self.config.tx_timeout(),
            self.process(),
            |task| {
                let this = self.clone();
                async move { this.postpone(task).await }.boxed()
            },
        )
        .await
    }
}

/// Reclaims manifests that lost their last tag and list membership.
#[derive(Clone)]
pub struct ManifestWorker {
    pool: MetadataPool,
    config: GcConfig,
}

impl ManifestWorker {
    pub fn new(pool: MetadataPool, config: GcConfig) -> Self {
        Self { pool, config }
    }

    async fn process(&self) -> TaskResult<GcManifestTask> {
        let mut tx = self.pool.begin().await.map_err(|e| (e, None))?;
        let task = match next_or_rollback(
            GcManifestTaskStore::next(tx.executor().map_err(|e| (e, None))?).await,
            &mut tx,
        )
        .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(false),
            Err(e) => return Err((e, None)),
        };

        tracing::info!(
            namespace_id = task.namespace_id,
            repository_id = task.repository_id,
            manifest_id = task.manifest_id,
            review_after = %task.review_after,
            review_count = task.review_count,
            event = %task.event,
            "processing manifest review task"
        );

        if let Err(e) = self.process_task(&mut tx, &task).await {
            let _ = tx.rollback().await;
            return Err((e, Some(task)));
        }
        if let Err(e) = tx.commit().await {
            return Err((e, Some(task)));
        }
        Ok(true)
    }

    async fn process_task(
        &self,
        tx: &mut crate::metadata::MetadataTx<'_>,
        task: &GcManifestTask,
    ) -> Result<()> {
        if GcManifestTaskStore::is_dangling(tx.executor()?, task.manifest_id).await? {
            match ManifestStore::find_by_id(tx.executor()?, task.manifest_id).await? {
                Some(manifest) => {
                    // deletion enqueues review work for the manifest's own
                    // references; the task row cascades away with the row
                    ManifestStore::delete_with_tracking(
                        tx.executor()?,
                        &manifest,
                        self.config.review_delay(),
                    )
                    .await?;
                    tracing::info!(manifest_id = task.manifest_id, "dangling manifest deleted");
                }
                None => {
                    GcManifestTaskStore::delete(tx.executor()?, task).await?;
                }
            }
        } else {
            GcManifestTaskStore::delete(tx.executor()?, task).await?;
        }
        Ok(())
    }

    async fn postpone(&self, task: GcManifestTask) {
        let delay = exponential_backoff(task.review_count);
        let result: Result<()> = async {
            let mut tx = self.pool.begin().await?;
            if let Some(locked) = GcManifestTaskStore::find_and_lock(
                tx.executor()?,
                task.namespace_id,
                task.repository_id,
                task.manifest_id,
            )
            .await?
            {
                if locked.review_after <= task.review_after {
                    if let Some((review_after, review_count)) =
                        GcManifestTaskStore::postpone(tx.executor()?, &task, delay).await?
                    {
                        tracing::info!(
                            manifest_id = task.manifest_id,
                            review_after = %review_after,
                            review_count,
                            "manifest review task postponed"
                        );
                    }
                }
            }
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(
                manifest_id = task.manifest_id,
                error = %e,
                "failed to postpone manifest review task"
            );
        }
    }
}

#[async_trait]
impl Worker for ManifestWorker {
    fn name(&self) -> &'static str {
        "gc-manifest-worker"
    }

    async fn run_once(&self) -> Result<bool> {
        run_guarded(
            self.name(),
            self.config.tx_timeout(),
            self.process(),
            |task| {
                let this = self.clone();
                async move { this.postpone(task).await }.boxed()
            },
        )
        .await
    }
}

async fn next_or_rollback<T>(
    next: Result<Option<T>>,
    tx: &mut crate::metadata::MetadataTx<'_>,
) -> Result<Option<T>> {
    match next {
        Ok(Some(task)) => Ok(Some(task)),
        Ok(None) => {
            tx.rollback().await?;
            Ok(None)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}
