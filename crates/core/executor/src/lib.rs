//! Parallel I/O executor.
//!
//! Runs independent storage calls and per-task pipelines (e.g. encode-then-put) with bounded
//! concurrency, retrying transient failures according to a [`RetryPolicy`]. A failed task never
//! cancels its siblings; the outcome of a batch lists what succeeded, what failed and what was
//! never started because the batch was cancelled.

use std::{
    collections::HashSet,
    future::Future,
    num::NonZeroUsize,
    sync::Arc,
    thread::available_parallelism,
    time::Duration,
};

use bytes::Bytes;
use futures::{StreamExt as _, stream};
use lakeshift_object_store::{ListPage, StorageClient};
use object_store::{ObjectMeta, path::Path};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod poll;
pub mod retry;

pub use self::{
    error::{BoxError, ServiceError, ServiceErrorKind, classify},
    poll::{PollError, PollPolicy},
    retry::RetryPolicy,
};

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of tasks in flight.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Concurrency bound derived from the number of available CPUs.
pub fn default_concurrency() -> usize {
    available_parallelism().map(NonZeroUsize::get).unwrap_or(4)
}

/// A task that failed, with the error it failed with.
#[derive(Debug)]
pub struct TaskFailure<T> {
    pub task: T,
    pub error: ServiceError,
}

/// Result of running a batch of tasks.
#[derive(Debug)]
pub struct BatchOutcome<T, O> {
    pub succeeded: Vec<(T, O)>,
    pub failed: Vec<TaskFailure<T>>,
    /// Tasks that never started because the batch was cancelled.
    pub cancelled: Vec<T>,
}

impl<T, O> Default for BatchOutcome<T, O> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

impl<T, O> BatchOutcome<T, O> {
    /// Whether every task succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.cancelled.len()
    }

    /// The tasks that succeeded, without their outputs.
    pub fn succeeded_tasks(&self) -> impl Iterator<Item = &T> {
        self.succeeded.iter().map(|(task, _)| task)
    }

    /// Converts to a `Result`, failing with the first failure if any task failed or was
    /// cancelled.
    pub fn into_result(mut self) -> Result<Vec<(T, O)>, ServiceError> {
        if !self.failed.is_empty() {
            return Err(self.failed.swap_remove(0).error);
        }
        if !self.cancelled.is_empty() {
            return Err(ServiceError::cancelled(format!(
                "{} of {} tasks were cancelled",
                self.cancelled.len(),
                self.total()
            )));
        }
        Ok(self.succeeded)
    }
}

/// An object to write.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub location: Path,
    pub payload: Bytes,
    pub content_type: Option<&'static str>,
}

/// Bounded-concurrency executor of storage calls.
#[derive(Debug, Clone)]
pub struct Executor {
    client: Arc<dyn StorageClient>,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(client: Arc<dyn StorageClient>, config: ExecutorConfig) -> Self {
        Self {
            client,
            concurrency: config.concurrency.max(1),
            retry: config.retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the cancellation token. Cancelling it stops new tasks from starting.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn client(&self) -> &Arc<dyn StorageClient> {
        &self.client
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs `op` once per task, at most [`concurrency`](Self::concurrency) at a time.
    ///
    /// Every invocation is retried independently under the executor's retry policy, so `op` is
    /// called again with a clone of the task for every attempt. Once the cancellation token is
    /// cancelled no further task starts; tasks already in flight run to completion. Tasks
    /// complete in no particular order.
    pub async fn run_batch<T, O, F, Fut>(
        &self,
        tasks: Vec<T>,
        describe: fn(&T) -> String,
        op: F,
    ) -> BatchOutcome<T, O>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<O, ServiceError>>,
    {
        let total = tasks.len();
        let op = &op;
        let results: Vec<(T, Result<O, ServiceError>)> = stream::iter(tasks)
            .map(|task| async move {
                let context = describe(&task);
                if self.cancel.is_cancelled() {
                    return (task, Err(ServiceError::cancelled(context)));
                }
                let result = self.retry.run(&context, || op(task.clone())).await;
                if let Err(err) = &result {
                    tracing::debug!(task = %context, error = %err, "task failed");
                }
                (task, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for (task, result) in results {
            match result {
                Ok(output) => outcome.succeeded.push((task, output)),
                Err(err) if err.is_cancelled() => outcome.cancelled.push(task),
                Err(error) => outcome.failed.push(TaskFailure { task, error }),
            }
        }
        tracing::debug!(
            total,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            cancelled = outcome.cancelled.len(),
            "batch finished"
        );
        outcome
    }

    /// Runs CPU-bound work on the blocking thread pool.
    pub async fn spawn_blocking<R, F>(&self, context: &str, work: F) -> Result<R, ServiceError>
    where
        F: FnOnce() -> Result<R, BoxError> + Send + 'static,
        R: Send + 'static,
    {
        match tokio::task::spawn_blocking(work).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(ServiceError::permanent(context.to_string(), err)),
            Err(err) => Err(ServiceError::permanent(context.to_string(), err)),
        }
    }

    pub async fn get(&self, location: &Path) -> Result<Bytes, ServiceError> {
        let context = format!("get '{location}'");
        self.retry
            .run(&context, || async {
                self.client
                    .get(location)
                    .await
                    .map_err(|err| ServiceError::from_store(context.clone(), err))
            })
            .await
    }

    pub async fn put(&self, request: &PutRequest) -> Result<(), ServiceError> {
        let context = format!("put '{}'", request.location);
        self.retry
            .run(&context, || async {
                self.client
                    .put(
                        &request.location,
                        request.payload.clone(),
                        request.content_type,
                    )
                    .await
                    .map(|_| ())
                    .map_err(|err| ServiceError::from_store(context.clone(), err))
            })
            .await
    }

    pub async fn delete(&self, location: &Path) -> Result<(), ServiceError> {
        let context = format!("delete '{location}'");
        self.retry
            .run(&context, || async {
                self.client
                    .delete(location)
                    .await
                    .map_err(|err| ServiceError::from_store(context.clone(), err))
            })
            .await
    }

    pub async fn copy(&self, from: &Path, to: &Path) -> Result<(), ServiceError> {
        let context = format!("copy '{from}' to '{to}'");
        self.retry
            .run(&context, || async {
                self.client
                    .copy(from, to)
                    .await
                    .map_err(|err| ServiceError::from_store(context.clone(), err))
            })
            .await
    }

    pub async fn head(&self, location: &Path) -> Result<ObjectMeta, ServiceError> {
        let context = format!("head '{location}'");
        self.retry
            .run(&context, || async {
                self.client
                    .head(location)
                    .await
                    .map_err(|err| ServiceError::from_store(context.clone(), err))
            })
            .await
    }

    /// Whether an object exists at `location`.
    pub async fn exists(&self, location: &Path) -> Result<bool, ServiceError> {
        match self.head(location).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Lists every object under `prefix`, sorted by location.
    pub async fn list(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, ServiceError> {
        let context = format!("list '{prefix}'");
        self.retry
            .run(&context, || async {
                self.client
                    .list(prefix)
                    .await
                    .map_err(|err| ServiceError::from_store(context.clone(), err))
            })
            .await
    }

    /// Lists one page of objects under `prefix`.
    pub async fn list_page(
        &self,
        prefix: &Path,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage, ServiceError> {
        let context = format!("list page of '{prefix}'");
        self.retry
            .run(&context, || async {
                self.client
                    .list_page(prefix, token, page_size)
                    .await
                    .map_err(|err| ServiceError::from_store(context.clone(), err))
            })
            .await
    }

    /// Lists every object under `prefix` page by page, following continuation tokens.
    pub async fn list_paginated(
        &self,
        prefix: &Path,
        page_size: usize,
    ) -> Result<Vec<ObjectMeta>, ServiceError> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .list_page(prefix, token.as_deref(), page_size.max(1))
                .await?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(objects),
            }
        }
    }

    /// Writes every object in parallel.
    pub async fn put_all(&self, requests: Vec<PutRequest>) -> BatchOutcome<PutRequest, ()> {
        self.run_batch(
            requests,
            |req| format!("put '{}'", req.location),
            |req| async move {
                self.client
                    .put(&req.location, req.payload.clone(), req.content_type)
                    .await
                    .map(|_| ())
                    .map_err(|err| ServiceError::from_store(format!("put '{}'", req.location), err))
            },
        )
        .await
    }

    /// Fetches every object in parallel.
    pub async fn get_all(&self, locations: Vec<Path>) -> BatchOutcome<Path, Bytes> {
        self.run_batch(
            locations,
            |location| format!("get '{location}'"),
            |location| async move {
                self.client
                    .get(&location)
                    .await
                    .map_err(|err| ServiceError::from_store(format!("get '{location}'"), err))
            },
        )
        .await
    }

    /// Deletes every object in parallel. Missing objects count as deleted.
    pub async fn delete_all(&self, locations: Vec<Path>) -> BatchOutcome<Path, ()> {
        self.run_batch(
            locations,
            |location| format!("delete '{location}'"),
            |location| async move {
                self.client
                    .delete(&location)
                    .await
                    .map_err(|err| ServiceError::from_store(format!("delete '{location}'"), err))
            },
        )
        .await
    }

    /// Copies every `(from, to)` pair in parallel.
    pub async fn copy_all(&self, pairs: Vec<(Path, Path)>) -> BatchOutcome<(Path, Path), ()> {
        self.run_batch(
            pairs,
            |(from, to)| format!("copy '{from}' to '{to}'"),
            |(from, to)| async move {
                self.client.copy(&from, &to).await.map_err(|err| {
                    ServiceError::from_store(format!("copy '{from}' to '{to}'"), err)
                })
            },
        )
        .await
    }

    /// Fetches the metadata of every object in parallel.
    pub async fn head_all(&self, locations: Vec<Path>) -> BatchOutcome<Path, ObjectMeta> {
        self.run_batch(
            locations,
            |location| format!("head '{location}'"),
            |location| async move {
                self.client
                    .head(&location)
                    .await
                    .map_err(|err| ServiceError::from_store(format!("head '{location}'"), err))
            },
        )
        .await
    }

    /// Fetches the size of every object in parallel.
    pub async fn objects_size(&self, locations: Vec<Path>) -> BatchOutcome<Path, u64> {
        let outcome = self.head_all(locations).await;
        BatchOutcome {
            succeeded: outcome
                .succeeded
                .into_iter()
                .map(|(location, meta)| (location, meta.size))
                .collect(),
            failed: outcome.failed,
            cancelled: outcome.cancelled,
        }
    }

    /// Deletes every object under `prefix`.
    ///
    /// Fails only if the listing fails; per-object failures are reported in the outcome.
    pub async fn delete_prefix(
        &self,
        prefix: &Path,
    ) -> Result<BatchOutcome<Path, ()>, ServiceError> {
        let locations = self
            .list(prefix)
            .await?
            .into_iter()
            .map(|meta| meta.location)
            .collect::<Vec<_>>();
        tracing::debug!(%prefix, objects = locations.len(), "deleting prefix");
        Ok(self.delete_all(locations).await)
    }

    /// Polls until every object is visible.
    ///
    /// Objects are checked in parallel every `poll_interval`; objects already seen are not
    /// checked again. Fails with the missing locations once `timeout` elapses.
    pub async fn wait_objects_exist(
        &self,
        locations: Vec<Path>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<(), WaitObjectsError> {
        let deadline = Instant::now() + timeout;
        let mut pending: HashSet<Path> = locations.into_iter().collect();
        loop {
            let outcome = self.head_all(pending.iter().cloned().collect()).await;
            for (location, _) in outcome.succeeded {
                pending.remove(&location);
            }
            if let Some(failure) = outcome.failed.into_iter().find(|f| !f.error.is_not_found()) {
                return Err(WaitObjectsError::Service(failure.error));
            }
            if pending.is_empty() {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(WaitObjectsError::Service(ServiceError::cancelled(
                    "wait for objects",
                )));
            }
            if Instant::now() + poll_interval > deadline {
                let mut missing: Vec<String> = pending.iter().map(Path::to_string).collect();
                missing.sort();
                return Err(WaitObjectsError::Timeout { timeout, missing });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Errors returned by [`Executor::wait_objects_exist`].
#[derive(Debug, thiserror::Error)]
pub enum WaitObjectsError {
    /// Some objects were still missing when the timeout elapsed.
    #[error("{} objects still missing after {:.1}s", .missing.len(), .timeout.as_secs_f32())]
    Timeout {
        timeout: Duration,
        missing: Vec<String>,
    },

    /// Checking an object failed with something other than "not found".
    #[error(transparent)]
    Service(ServiceError),
}
