//! Object storage benchmarks.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::CleanupTracker;
use crate::backend::{DynObjectStorage, ObjectData, ObjectHandle};
use crate::coordinator;
use crate::error::{Error, Result};
use crate::lifecycle::{Transferred, Workload};
use crate::pool::{ClientPool, RunnerSlot};
use crate::scenario::ScenarioParameters;
use crate::stream;

/// Object storage operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectOperation {
    /// Uploads objects.
    AddObject,
    /// Downloads objects uploaded during setup and verifies their size.
    GetObject,
    /// Looks up the sizes of objects uploaded during setup.
    GetObjectSize,
    /// Deletes objects uploaded during setup.
    DeleteObject,
}

impl ObjectOperation {
    /// All object operations in reporting order.
    pub const ALL: [Self; 4] = [
        Self::AddObject,
        Self::GetObject,
        Self::GetObjectSize,
        Self::DeleteObject,
    ];

    /// The name used in configuration files and reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::AddObject => "AddObject",
            Self::GetObject => "GetObject",
            Self::GetObjectSize => "GetObjectSize",
            Self::DeleteObject => "DeleteObject",
        }
    }

    fn needs_fixtures(self) -> bool {
        !matches!(self, Self::AddObject)
    }
}

impl fmt::Display for ObjectOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How object operations are spread across clients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// A single client moves a single object, inline on the driver task.
    Sequential,
    /// Every runner moves `objects_per_runner` objects concurrently.
    #[default]
    Throughput,
}

impl Shape {
    /// Number of runner slots used for the given parameters.
    pub fn runners(self, parameters: &ScenarioParameters) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Throughput => parameters.runners(),
        }
    }

    /// Number of objects each runner moves per iteration.
    pub fn objects_per_runner(self, parameters: &ScenarioParameters) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Throughput => parameters.objects_per_runner as usize,
        }
    }
}

/// Everything one runner needs, owned so it can move into a spawned task.
#[derive(Clone)]
struct RunnerContext {
    slot: RunnerSlot,
    client: Arc<DynObjectStorage>,
    session_id: String,
    payload: Bytes,
    chunk_upload_size: usize,
    objects: usize,
    tracker: CleanupTracker,
}

impl RunnerContext {
    fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    async fn upload(&self) -> Result<ObjectHandle> {
        let data = ObjectData {
            result_id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
        };
        let chunks = stream::split(&self.payload, self.chunk_upload_size).into_stream();
        let handle = self
            .client
            .add_or_update(&data, chunks)
            .await
            .map_err(|e| Error::operation("uploading object", e))?;
        self.tracker.track(self.slot, handle.clone());
        Ok(handle)
    }

    async fn upload_all(self) -> Result<Vec<ObjectHandle>> {
        let mut handles = Vec::with_capacity(self.objects);
        for _ in 0..self.objects {
            handles.push(self.upload().await?);
        }
        Ok(handles)
    }

    async fn run(
        self,
        operation: ObjectOperation,
        fixtures: Vec<ObjectHandle>,
    ) -> Result<Transferred> {
        match operation {
            ObjectOperation::AddObject => {
                let handles = self.clone().upload_all().await?;
                Ok(Transferred::bytes(handles.len() as u64 * self.payload_len()))
            }
            ObjectOperation::GetObject => {
                let mut moved = 0;
                for handle in &fixtures {
                    let chunks = self
                        .client
                        .get_values(handle)
                        .await
                        .map_err(|e| Error::operation("downloading object", e))?;
                    moved += stream::reassemble(chunks, self.payload_len()).await?.len() as u64;
                }
                Ok(Transferred::bytes(moved))
            }
            ObjectOperation::GetObjectSize => {
                let sizes = self
                    .client
                    .get_sizes(&fixtures)
                    .await
                    .map_err(|e| Error::operation("looking up object sizes", e))?;
                for handle in &fixtures {
                    let actual = sizes.get(handle).copied().flatten();
                    if actual != Some(self.payload_len()) {
                        return Err(Error::SizeMismatch {
                            expected: self.payload_len(),
                            actual: actual.unwrap_or(0),
                        });
                    }
                }
                Ok(Transferred::default())
            }
            ObjectOperation::DeleteObject => {
                self.client
                    .try_delete(&fixtures)
                    .await
                    .map_err(|e| Error::operation("deleting objects", e))?;
                Ok(Transferred::default())
            }
        }
    }
}

/// One iteration of an object storage operation.
pub struct ObjectWorkload {
    operation: ObjectOperation,
    shape: Shape,
    pool: Arc<ClientPool<DynObjectStorage>>,
    payload: Bytes,
    chunk_upload_size: usize,
    objects_per_runner: usize,
    run_id: String,
    tracker: CleanupTracker,
    fixtures: Vec<Vec<ObjectHandle>>,
}

impl ObjectWorkload {
    /// Prepares an iteration of `operation` on the clients of `pool`.
    ///
    /// The pool must hold at least [`Shape::runners`] clients.
    pub fn new(
        operation: ObjectOperation,
        shape: Shape,
        pool: Arc<ClientPool<DynObjectStorage>>,
        parameters: &ScenarioParameters,
        payload: Bytes,
    ) -> Self {
        Self {
            operation,
            shape,
            pool,
            payload,
            chunk_upload_size: parameters.chunk_upload_size as usize,
            objects_per_runner: shape.objects_per_runner(parameters),
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            tracker: CleanupTracker::new(),
            fixtures: Vec::new(),
        }
    }

    /// The tracker of handles created by this iteration.
    pub fn tracker(&self) -> &CleanupTracker {
        &self.tracker
    }

    /// The session identifier of the given runner, unique per iteration.
    pub fn session_id(&self, slot: RunnerSlot) -> String {
        format!("benchmonik-{}-{slot}", self.run_id)
    }

    fn runners(&self) -> usize {
        match self.shape {
            Shape::Sequential => 1,
            Shape::Throughput => self.pool.len(),
        }
    }

    fn context(&self, slot: RunnerSlot) -> RunnerContext {
        RunnerContext {
            slot,
            client: self.pool.client(slot),
            session_id: self.session_id(slot),
            payload: self.payload.clone(),
            chunk_upload_size: self.chunk_upload_size,
            objects: self.objects_per_runner,
            tracker: self.tracker.clone(),
        }
    }
}

impl fmt::Debug for ObjectWorkload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWorkload")
            .field("operation", &self.operation)
            .field("shape", &self.shape)
            .field("payload", &self.payload.len())
            .field("objects_per_runner", &self.objects_per_runner)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Workload for ObjectWorkload {
    fn name(&self) -> &'static str {
        self.operation.name()
    }

    async fn setup(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.operation.needs_fixtures() {
            return Ok(());
        }
        self.fixtures = match self.shape {
            Shape::Sequential => {
                let context = self.context(RunnerSlot::new(0));
                vec![coordinator::run_inline(cancel, context.upload_all()).await?]
            }
            Shape::Throughput => {
                coordinator::run(self.runners(), cancel, |slot| self.context(slot).upload_all())
                    .await?
            }
        };
        Ok(())
    }

    async fn measured(&self, cancel: &CancellationToken) -> Result<Transferred> {
        let operation = self.operation;
        let fixtures = |slot: RunnerSlot| {
            self.fixtures
                .get(slot.index())
                .cloned()
                .unwrap_or_default()
        };

        match self.shape {
            Shape::Sequential => {
                let slot = RunnerSlot::new(0);
                let work = self.context(slot).run(operation, fixtures(slot));
                coordinator::run_inline(cancel, work).await
            }
            Shape::Throughput => {
                let moved = coordinator::run(self.runners(), cancel, |slot| {
                    self.context(slot).run(operation, fixtures(slot))
                })
                .await?;
                Ok(moved.into_iter().sum())
            }
        }
    }

    async fn cleanup(&mut self, _cancel: &CancellationToken) -> Result<()> {
        let mut first_error = None;
        for (slot, handles) in self.tracker.drain() {
            // Every runner deletes through its own client, inside its own session.
            let result = self.pool.client(slot).try_delete(&handles).await;
            if let Err(error) = result {
                tracing::warn!(
                    %slot,
                    objects = handles.len(),
                    error = &error as &dyn std::error::Error,
                    "failed to delete objects"
                );
                first_error.get_or_insert(Error::operation("deleting objects", error));
            }
        }
        self.fixtures.clear();
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::in_memory::InMemoryObjectStorage;
    use crate::pool::Capability;

    async fn pool(
        storage: &InMemoryObjectStorage,
        runners: usize,
    ) -> Arc<ClientPool<DynObjectStorage>> {
        let pool = ClientPool::acquire(Capability::ObjectStorage, runners, |_| {
            Ok(Arc::new(storage.clone()) as Arc<DynObjectStorage>)
        })
        .await
        .unwrap();
        Arc::new(pool)
    }

    fn parameters(runners: u64, objects: u64) -> ScenarioParameters {
        ScenarioParameters {
            payload_size: 1000,
            chunk_upload_size: 300,
            concurrent_runners: runners,
            objects_per_runner: objects,
            ..Default::default()
        }
    }

    async fn iterate(workload: &mut ObjectWorkload) -> Result<Transferred> {
        let cancel = CancellationToken::new();
        workload.setup(&cancel).await?;
        let moved = workload.measured(&cancel).await;
        workload.cleanup(&cancel).await?;
        moved
    }

    #[tokio::test]
    async fn every_operation_leaves_the_store_empty() {
        let storage = InMemoryObjectStorage::new(128);
        let params = parameters(3, 2);
        let payload = crate::payload::generate(params.payload_size);
        let pool = pool(&storage, 3).await;

        for operation in ObjectOperation::ALL {
            let mut workload = ObjectWorkload::new(
                operation,
                Shape::Throughput,
                Arc::clone(&pool),
                &params,
                payload.clone(),
            );
            let moved = iterate(&mut workload).await.unwrap();
            assert!(storage.is_empty(), "{operation} left objects behind");

            let expected = match operation {
                ObjectOperation::AddObject | ObjectOperation::GetObject => 6 * 1000,
                _ => 0,
            };
            assert_eq!(moved.bytes, expected, "{operation}");
        }
    }

    #[tokio::test]
    async fn sequential_shape_uses_one_object() {
        let storage = InMemoryObjectStorage::new(128);
        let params = parameters(10, 20);
        let pool = pool(&storage, 1).await;
        let mut workload = ObjectWorkload::new(
            ObjectOperation::AddObject,
            Shape::Sequential,
            pool,
            &params,
            crate::payload::generate(params.payload_size),
        );

        let cancel = CancellationToken::new();
        workload.setup(&cancel).await.unwrap();
        let moved = workload.measured(&cancel).await.unwrap();
        assert_eq!(moved.bytes, 1000);
        assert_eq!(storage.len(), 1);
        assert_eq!(
            storage.handles_for_session(&workload.session_id(RunnerSlot::new(0))).len(),
            1
        );

        workload.cleanup(&cancel).await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn sessions_are_distinct_per_runner_and_iteration() {
        let storage = InMemoryObjectStorage::new(128);
        let params = parameters(2, 1);
        let pool = pool(&storage, 2).await;
        let payload = crate::payload::generate(params.payload_size);

        let first = ObjectWorkload::new(
            ObjectOperation::AddObject,
            Shape::Throughput,
            Arc::clone(&pool),
            &params,
            payload.clone(),
        );
        let second = ObjectWorkload::new(
            ObjectOperation::AddObject,
            Shape::Throughput,
            pool,
            &params,
            payload,
        );

        let a = first.session_id(RunnerSlot::new(0));
        let b = first.session_id(RunnerSlot::new(1));
        let c = second.session_id(RunnerSlot::new(0));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(b.ends_with("-runner-1"));
    }
}
