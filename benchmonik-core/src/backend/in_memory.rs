//! In-memory backends.
//!
//! [`InMemoryObjectStorage`] keeps objects in a `HashMap` and [`InMemoryBroker`] keeps one FIFO
//! per partition. Both are [`Clone`]: clones share the same state, so every runner can hold its
//! own client of one logical backend while tests keep a handle for direct inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};

use super::common::{
    BackendError, BackendResult, Disposition, MessageEnvelope, MessageHandle, MessageHandler,
    MessageStream, ObjectData, ObjectHandle, ObjectStorage, PullQueueStorage, PushQueueStorage,
    SizeMap, StorageClient,
};
use crate::stream::{self, PayloadStream};

#[derive(Debug)]
struct StoredObject {
    session_id: String,
    payload: Bytes,
}

type Store = HashMap<ObjectHandle, StoredObject>;

/// Object storage backed by a shared `HashMap`.
///
/// Downloads are streamed in chunks of the configured download chunk size.
#[derive(Debug, Clone)]
pub struct InMemoryObjectStorage {
    store: Arc<Mutex<Store>>,
    chunk_size: usize,
}

impl InMemoryObjectStorage {
    /// Creates an empty store that streams downloads in chunks of `chunk_size` bytes.
    ///
    /// A chunk size of zero is raised to one.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Returns a client sharing this store with a different download chunk size.
    pub fn with_chunk_size(&self, chunk_size: usize) -> Self {
        Self {
            store: Arc::clone(&self.store),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    /// Returns `true` if the store has no objects.
    pub fn is_empty(&self) -> bool {
        self.store.lock().unwrap().is_empty()
    }

    /// Returns `true` if the store contains the given object.
    pub fn contains(&self, handle: &ObjectHandle) -> bool {
        self.store.lock().unwrap().contains_key(handle)
    }

    /// Returns a clone of the stored payload, if present.
    pub fn get_stored(&self, handle: &ObjectHandle) -> Option<Bytes> {
        let store = self.store.lock().unwrap();
        store.get(handle).map(|object| object.payload.clone())
    }

    /// Returns the handles of all objects owned by the given session, sorted.
    pub fn handles_for_session(&self, session_id: &str) -> Vec<ObjectHandle> {
        let store = self.store.lock().unwrap();
        let mut handles: Vec<_> = store
            .iter()
            .filter(|(_, object)| object.session_id == session_id)
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        handles
    }
}

impl Default for InMemoryObjectStorage {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait::async_trait]
impl StorageClient for InMemoryObjectStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn add_or_update(
        &self,
        data: &ObjectData,
        chunks: PayloadStream,
    ) -> BackendResult<ObjectHandle> {
        let payload: BytesMut = chunks.try_collect().await?;
        let handle = ObjectHandle::new(format!("{}/{}", data.session_id, data.result_id));

        let object = StoredObject {
            session_id: data.session_id.clone(),
            payload: payload.freeze(),
        };
        self.store.lock().unwrap().insert(handle.clone(), object);
        Ok(handle)
    }

    async fn get_values(&self, handle: &ObjectHandle) -> BackendResult<PayloadStream> {
        let payload = self
            .get_stored(handle)
            .ok_or_else(|| BackendError::NotFound(handle.clone()))?;
        Ok(stream::split(&payload, self.chunk_size).into_stream())
    }

    async fn get_sizes(&self, handles: &[ObjectHandle]) -> BackendResult<SizeMap> {
        let store = self.store.lock().unwrap();
        Ok(handles
            .iter()
            .map(|handle| {
                let size = store.get(handle).map(|object| object.payload.len() as u64);
                (handle.clone(), size)
            })
            .collect())
    }

    async fn try_delete(&self, handles: &[ObjectHandle]) -> BackendResult<()> {
        let mut store = self.store.lock().unwrap();
        for handle in handles {
            store.remove(handle);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    envelope: MessageEnvelope,
}

#[derive(Debug, Default)]
struct Partition {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    partitions: HashMap<String, Partition>,
    next_id: u64,
}

/// A message broker with one FIFO per partition.
///
/// Pulled messages stay in flight until their handle is released. A `Processed` or `Cancelled`
/// disposition removes the message; abandoning it puts it back at the end of its partition.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of messages waiting to be pulled from `partition`.
    pub fn pending(&self, partition: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.partitions.get(partition).map_or(0, |p| p.ready.len())
    }

    /// Returns the number of messages of `partition` that were pulled but not released.
    pub fn in_flight(&self, partition: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.partitions.get(partition).map_or(0, |p| p.in_flight.len())
    }

    /// Returns the number of waiting and in-flight messages across all partitions.
    pub fn total(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .partitions
            .values()
            .map(|p| p.ready.len() + p.in_flight.len())
            .sum()
    }
}

#[async_trait::async_trait]
impl StorageClient for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory-queue"
    }

    async fn init(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl PushQueueStorage for InMemoryBroker {
    async fn push_messages(
        &self,
        messages: Vec<MessageEnvelope>,
        partition: &str,
    ) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        let first_id = state.next_id;
        state.next_id += messages.len() as u64;

        let queue = state.partitions.entry(partition.to_owned()).or_default();
        for (offset, envelope) in messages.into_iter().enumerate() {
            queue.ready.push_back(StoredMessage {
                message_id: format!("msg-{}", first_id + offset as u64),
                envelope,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PullQueueStorage for InMemoryBroker {
    async fn pull_messages(&self, partition: &str, max: usize) -> BackendResult<MessageStream> {
        let mut handles = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(queue) = state.partitions.get_mut(partition) {
                while handles.len() < max {
                    let Some(message) = queue.ready.pop_front() else {
                        break;
                    };
                    let handler = InMemoryMessage {
                        state: Arc::clone(&self.state),
                        partition: partition.to_owned(),
                        message_id: message.message_id.clone(),
                        task_id: message.envelope.task_id.clone(),
                    };
                    queue.in_flight.insert(message.message_id.clone(), message);
                    handles.push(MessageHandle::new(Box::new(handler)));
                }
            }
        }

        Ok(futures_util::stream::iter(handles.into_iter().map(Ok)).boxed())
    }
}

#[derive(Debug)]
struct InMemoryMessage {
    state: Arc<Mutex<BrokerState>>,
    partition: String,
    message_id: String,
    task_id: String,
}

#[async_trait::async_trait]
impl MessageHandler for InMemoryMessage {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn release(self: Box<Self>, disposition: Option<Disposition>) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        let message = state
            .partitions
            .get_mut(&self.partition)
            .and_then(|queue| queue.in_flight.remove(&self.message_id))
            .ok_or_else(|| {
                BackendError::generic(format!("message `{}` is not in flight", self.message_id))
            })?;

        if disposition.is_none() {
            let queue = state.partitions.entry(self.partition.clone()).or_default();
            queue.ready.push_back(message);
        }
        Ok(())
    }

    fn abandon(self: Box<Self>) {
        // Runs from `Drop`, so a poisoned lock is skipped rather than propagated.
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let Some(queue) = state.partitions.get_mut(&self.partition) else {
            return;
        };
        if let Some(message) = queue.in_flight.remove(&self.message_id) {
            tracing::debug!(message_id = %self.message_id, "requeueing dropped message");
            queue.ready.push_back(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn data(session: &str, result: &str) -> ObjectData {
        ObjectData {
            result_id: result.into(),
            session_id: session.into(),
        }
    }

    fn envelope(task: usize) -> MessageEnvelope {
        MessageEnvelope {
            task_id: format!("task-{task}"),
            session_id: "session".into(),
            options: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn downloads_in_configured_chunks() {
        let storage = InMemoryObjectStorage::new(4);
        let payload = Bytes::from_static(b"0123456789");
        let handle = storage
            .add_or_update(&data("s", "r"), stream::split(&payload, 3).into_stream())
            .await
            .unwrap();

        let chunks: Vec<Bytes> = storage
            .get_values(&handle)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let lengths: Vec<_> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(lengths, [4, 4, 2]);
        assert_eq!(storage.get_stored(&handle), Some(payload));
    }

    #[tokio::test]
    async fn sizes_and_deletes() {
        let storage = InMemoryObjectStorage::new(1024);
        let payload = Bytes::from(vec![7u8; 100]);
        let handle = storage
            .add_or_update(&data("s", "r"), stream::split(&payload, 10).into_stream())
            .await
            .unwrap();
        let unknown = ObjectHandle::new("s/unknown");

        let sizes = storage
            .get_sizes(&[handle.clone(), unknown.clone()])
            .await
            .unwrap();
        assert_eq!(sizes[&handle], Some(100));
        assert_eq!(sizes[&unknown], None);

        storage.try_delete(&[handle.clone(), unknown]).await.unwrap();
        assert!(storage.is_empty());
        assert!(matches!(
            storage.get_values(&handle).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clones_share_the_store() {
        let storage = InMemoryObjectStorage::new(1024);
        let other = storage.with_chunk_size(1);
        other
            .add_or_update(&data("a", "1"), stream::split(&Bytes::from("x"), 1).into_stream())
            .await
            .unwrap();
        storage
            .add_or_update(&data("b", "1"), stream::split(&Bytes::from("y"), 1).into_stream())
            .await
            .unwrap();

        assert_eq!(storage.len(), 2);
        assert_eq!(other.handles_for_session("a"), [ObjectHandle::new("a/1")]);
    }

    #[tokio::test]
    async fn pull_is_fifo_and_stops_when_empty() {
        let broker = InMemoryBroker::new();
        broker
            .push_messages((0..5).map(envelope).collect(), "p")
            .await
            .unwrap();

        let handles: Vec<_> = broker
            .pull_messages("p", 10)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let tasks: Vec<_> = handles.iter().map(|h| h.task_id().to_owned()).collect();
        assert_eq!(tasks, ["task-0", "task-1", "task-2", "task-3", "task-4"]);
        assert_eq!(broker.in_flight("p"), 5);

        for mut handle in handles {
            handle.set_disposition(Disposition::Processed).unwrap();
            handle.release().await.unwrap();
        }
        assert_eq!(broker.total(), 0);
    }

    #[tokio::test]
    async fn abandoned_messages_are_requeued() {
        let broker = InMemoryBroker::new();
        broker
            .push_messages((0..2).map(envelope).collect(), "p")
            .await
            .unwrap();

        let mut stream = broker.pull_messages("p", 1).await.unwrap();
        let handle = stream.try_next().await.unwrap().unwrap();
        assert_eq!(broker.pending("p"), 1);
        handle.release().await.unwrap();

        assert_eq!(broker.pending("p"), 2);
        assert_eq!(broker.in_flight("p"), 0);

        let mut stream = broker.pull_messages("p", 2).await.unwrap();
        let mut first = stream.try_next().await.unwrap().unwrap();
        assert_eq!(first.task_id(), "task-1");
        first.set_disposition(Disposition::Cancelled).unwrap();
        first.release().await.unwrap();
        let mut second = stream.try_next().await.unwrap().unwrap();
        second.set_disposition(Disposition::Cancelled).unwrap();
        second.release().await.unwrap();
        assert_eq!(broker.total(), 0);
    }

    #[tokio::test]
    async fn dropped_handles_are_requeued() {
        let broker = InMemoryBroker::new();
        broker
            .push_messages((0..3).map(envelope).collect(), "p")
            .await
            .unwrap();

        let mut stream = broker.pull_messages("p", 3).await.unwrap();
        let mut first = stream.try_next().await.unwrap().unwrap();
        first.set_disposition(Disposition::Processed).unwrap();
        drop(first);
        assert_eq!(broker.in_flight("p"), 2);

        // The remaining handles are still inside the stream.
        drop(stream);
        assert_eq!(broker.in_flight("p"), 0);
        assert_eq!(broker.pending("p"), 3);
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let broker = InMemoryBroker::new();
        broker
            .push_messages((0..3).map(envelope).collect(), "a")
            .await
            .unwrap();

        let pulled: Vec<_> = broker
            .pull_messages("b", 10)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(pulled.is_empty());
        assert_eq!(broker.pending("a"), 3);
    }
}
