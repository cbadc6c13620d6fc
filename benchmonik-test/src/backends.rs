//! Instrumented backends.
//!
//! [`InstrumentedObjectStorage`] and [`InstrumentedQueue`] wrap the in-memory backends of
//! `benchmonik-core`. They record the shape of every call, can inject failures, and track how
//! many calls were in flight at the same time. Clones share all state, so a test can keep one
//! copy for assertions while the registry hands out others.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use benchmonik_core::backend::in_memory::{InMemoryBroker, InMemoryObjectStorage};
use benchmonik_core::backend::{
    BackendError, BackendResult, DynObjectStorage, DynPullQueue, DynPushQueue, MessageEnvelope,
    MessageStream, ObjectData, ObjectHandle, ObjectStorage, PullQueueStorage, PushQueueStorage,
    SizeMap, StorageClient,
};
use benchmonik_core::pool::RunnerSlot;
use benchmonik_core::registry::{FactoryContext, ObjectStorageFactory, QueueFactory};
use benchmonik_core::stream::PayloadStream;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};

/// Failures to inject into an [`InstrumentedObjectStorage`].
#[derive(Clone, Debug, Default)]
pub struct ObjectFaults {
    /// Fail `init`.
    pub fail_init: bool,
    /// Fail every upload after this many have succeeded.
    pub fail_uploads_after: Option<usize>,
    /// Fail every download.
    pub fail_downloads: bool,
    /// Drop the last byte of every download.
    pub truncate_downloads: bool,
    /// Fail every delete.
    pub fail_deletes: bool,
}

/// Calls observed by an [`InstrumentedObjectStorage`].
#[derive(Clone, Debug, Default)]
pub struct ObjectCalls {
    /// Number of `init` calls.
    pub inits: usize,
    /// Chunk lengths of every upload, in call order.
    pub uploads: Vec<Vec<usize>>,
    /// Sessions of every upload, in call order.
    pub sessions: Vec<String>,
    /// Number of downloads.
    pub downloads: usize,
    /// Number of size lookups.
    pub size_lookups: usize,
    /// Handles of every delete call, in call order.
    pub deletes: Vec<Vec<ObjectHandle>>,
}

#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) -> GaugeGuard<'_> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(current, Ordering::SeqCst);
        GaugeGuard(self)
    }
}

struct GaugeGuard<'a>(&'a Gauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory object storage that records calls and injects failures.
#[derive(Clone, Debug)]
pub struct InstrumentedObjectStorage {
    inner: InMemoryObjectStorage,
    calls: Arc<Mutex<ObjectCalls>>,
    faults: Arc<Mutex<ObjectFaults>>,
    gauge: Arc<Gauge>,
    delay: Option<Duration>,
}

impl InstrumentedObjectStorage {
    /// Wraps an empty store that downloads in chunks of `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            inner: InMemoryObjectStorage::new(chunk_size),
            calls: Default::default(),
            faults: Default::default(),
            gauge: Default::default(),
            delay: None,
        }
    }

    /// Delays every upload, so that concurrent uploads overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replaces the injected failures.
    pub fn set_faults(&self, faults: ObjectFaults) {
        *self.faults.lock().unwrap() = faults;
    }

    /// Returns a snapshot of the observed calls.
    pub fn calls(&self) -> ObjectCalls {
        self.calls.lock().unwrap().clone()
    }

    /// The highest number of uploads that were in flight at once.
    pub fn max_concurrent_uploads(&self) -> usize {
        self.gauge.max.load(Ordering::SeqCst)
    }

    /// The wrapped store, for inspecting its contents.
    pub fn store(&self) -> &InMemoryObjectStorage {
        &self.inner
    }

    fn faults(&self) -> ObjectFaults {
        self.faults.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StorageClient for InstrumentedObjectStorage {
    fn name(&self) -> &'static str {
        "instrumented"
    }

    async fn init(&self) -> BackendResult<()> {
        self.calls.lock().unwrap().inits += 1;
        if self.faults().fail_init {
            return Err(BackendError::generic("injected init failure"));
        }
        self.inner.init().await
    }
}

#[async_trait::async_trait]
impl ObjectStorage for InstrumentedObjectStorage {
    async fn add_or_update(
        &self,
        data: &ObjectData,
        chunks: PayloadStream,
    ) -> BackendResult<ObjectHandle> {
        let _guard = self.gauge.enter();
        let chunks: Vec<Bytes> = chunks.try_collect().await?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let succeeded = {
            let mut calls = self.calls.lock().unwrap();
            calls.uploads.push(chunks.iter().map(Bytes::len).collect());
            calls.sessions.push(data.session_id.clone());
            calls.uploads.len() - 1
        };
        if self
            .faults()
            .fail_uploads_after
            .is_some_and(|limit| succeeded >= limit)
        {
            return Err(BackendError::generic("injected upload failure"));
        }

        let stream = futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed();
        self.inner.add_or_update(data, stream).await
    }

    async fn get_values(&self, handle: &ObjectHandle) -> BackendResult<PayloadStream> {
        self.calls.lock().unwrap().downloads += 1;
        let faults = self.faults();
        if faults.fail_downloads {
            return Err(BackendError::generic("injected download failure"));
        }

        let stream = self.inner.get_values(handle).await?;
        if !faults.truncate_downloads {
            return Ok(stream);
        }
        let mut payload: Vec<u8> = stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        payload.pop();
        let chunk: std::io::Result<Bytes> = Ok(payload.into());
        Ok(futures_util::stream::iter([chunk]).boxed())
    }

    async fn get_sizes(&self, handles: &[ObjectHandle]) -> BackendResult<SizeMap> {
        self.calls.lock().unwrap().size_lookups += 1;
        self.inner.get_sizes(handles).await
    }

    async fn try_delete(&self, handles: &[ObjectHandle]) -> BackendResult<()> {
        self.calls.lock().unwrap().deletes.push(handles.to_vec());
        if self.faults().fail_deletes {
            return Err(BackendError::generic("injected delete failure"));
        }
        self.inner.try_delete(handles).await
    }
}

impl ObjectStorageFactory for InstrumentedObjectStorage {
    fn create(
        &self,
        context: &FactoryContext<'_>,
        _slot: RunnerSlot,
    ) -> BackendResult<Arc<DynObjectStorage>> {
        let mut client = self.clone();
        client.inner = self
            .inner
            .with_chunk_size(context.parameters.chunk_download_size as usize);
        Ok(Arc::new(client))
    }
}

/// Failures to inject into an [`InstrumentedQueue`].
#[derive(Clone, Debug, Default)]
pub struct QueueFaults {
    /// Fail every push call after this many have succeeded.
    pub fail_pushes_after: Option<usize>,
    /// Fail every pull call.
    pub fail_pulls: bool,
    /// Zero-based index of a pull call that never returns, holding the messages it received.
    pub stall_pull_call: Option<usize>,
    /// Zero-based index of a pull call whose stream fails after its first message.
    pub break_pull_call: Option<usize>,
}

/// Calls observed by an [`InstrumentedQueue`].
#[derive(Clone, Debug, Default)]
pub struct QueueCalls {
    /// Size and partition of every push call, in call order.
    pub pushes: Vec<(usize, String)>,
    /// Requested and returned message counts of every pull call, in call order.
    pub pulls: Vec<(usize, usize)>,
}

/// In-memory broker that records calls and injects failures.
#[derive(Clone, Debug, Default)]
pub struct InstrumentedQueue {
    inner: InMemoryBroker,
    calls: Arc<Mutex<QueueCalls>>,
    faults: Arc<Mutex<QueueFaults>>,
}

impl InstrumentedQueue {
    /// Wraps an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the injected failures.
    pub fn set_faults(&self, faults: QueueFaults) {
        *self.faults.lock().unwrap() = faults;
    }

    /// Returns a snapshot of the observed calls.
    pub fn calls(&self) -> QueueCalls {
        self.calls.lock().unwrap().clone()
    }

    /// The wrapped broker, for inspecting its contents.
    pub fn broker(&self) -> &InMemoryBroker {
        &self.inner
    }
}

#[async_trait::async_trait]
impl StorageClient for InstrumentedQueue {
    fn name(&self) -> &'static str {
        "instrumented-queue"
    }

    async fn init(&self) -> BackendResult<()> {
        self.inner.init().await
    }
}

#[async_trait::async_trait]
impl PushQueueStorage for InstrumentedQueue {
    async fn push_messages(
        &self,
        messages: Vec<MessageEnvelope>,
        partition: &str,
    ) -> BackendResult<()> {
        let succeeded = {
            let mut calls = self.calls.lock().unwrap();
            calls.pushes.push((messages.len(), partition.to_owned()));
            calls.pushes.len() - 1
        };
        let limit = self.faults.lock().unwrap().fail_pushes_after;
        if limit.is_some_and(|limit| succeeded >= limit) {
            return Err(BackendError::generic("injected push failure"));
        }
        self.inner.push_messages(messages, partition).await
    }
}

#[async_trait::async_trait]
impl PullQueueStorage for InstrumentedQueue {
    async fn pull_messages(&self, partition: &str, max: usize) -> BackendResult<MessageStream> {
        let faults = self.faults.lock().unwrap().clone();
        if faults.fail_pulls {
            self.calls.lock().unwrap().pulls.push((max, 0));
            return Err(BackendError::generic("injected pull failure"));
        }

        let mut handles: Vec<_> = self.inner.pull_messages(partition, max).await?.collect().await;
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.pulls.push((max, handles.len()));
            calls.pulls.len() - 1
        };
        if faults.stall_pull_call == Some(call) {
            std::future::pending::<()>().await;
        }
        if faults.break_pull_call != Some(call) {
            return Ok(futures_util::stream::iter(handles).boxed());
        }

        handles.truncate(1);
        let broken = futures_util::stream::once(async {
            Err(BackendError::generic("injected stream failure"))
        });
        Ok(futures_util::stream::iter(handles).chain(broken).boxed())
    }
}

impl QueueFactory for InstrumentedQueue {
    fn create_push(
        &self,
        _context: &FactoryContext<'_>,
        _slot: RunnerSlot,
    ) -> BackendResult<Arc<DynPushQueue>> {
        Ok(Arc::new(self.clone()))
    }

    fn create_pull(
        &self,
        _context: &FactoryContext<'_>,
        _slot: RunnerSlot,
    ) -> BackendResult<Arc<DynPullQueue>> {
        Ok(Arc::new(self.clone()))
    }
}
