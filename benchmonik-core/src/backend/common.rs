use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::stream::PayloadStream;

/// Opaque identifier assigned by an [`ObjectStorage`] backend to a stored object.
///
/// The iteration that created a handle owns it until its cleanup phase deletes it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(Bytes);

impl ObjectHandle {
    /// Wraps raw backend bytes into a handle.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes of this handle.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({self})")
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                for byte in self.0.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Metadata passed along with every object upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectData {
    /// Identifier of the result this object stores.
    pub result_id: String,
    /// Session owning the object. Each runner uses its own session.
    pub session_id: String,
}

/// Mapping returned by [`ObjectStorage::get_sizes`]. Unknown handles map to `None`.
pub type SizeMap = HashMap<ObjectHandle, Option<u64>>;

/// A logical unit of work pushed to a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Identifier of the task this message schedules.
    pub task_id: String,
    /// Session the task belongs to.
    pub session_id: String,
    /// Backend-opaque task options.
    pub options: BTreeMap<String, String>,
}

/// The final state of a pulled message, set once before its handle is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The message was handled and must not be redelivered.
    Processed,
    /// The message was rejected and must not be redelivered.
    Cancelled,
}

/// Stream of messages returned by [`PullQueueStorage::pull_messages`].
pub type MessageStream = BoxStream<'static, BackendResult<MessageHandle>>;

/// Backend side of a received, in-flight message.
#[async_trait::async_trait]
pub trait MessageHandler: Debug + Send + Sync + 'static {
    /// The backend-assigned message identifier.
    fn message_id(&self) -> &str;

    /// The task identifier carried by the message.
    fn task_id(&self) -> &str;

    /// Hands the message back to the backend.
    ///
    /// `None` means the handle was abandoned; requeue behavior is up to the backend.
    async fn release(self: Box<Self>, disposition: Option<Disposition>) -> BackendResult<()>;

    /// Gives the message back without awaiting the backend, when its handle is dropped unreleased.
    ///
    /// Backends that can requeue synchronously should do so here. The default only logs, leaving
    /// the message to the backend's own redelivery.
    fn abandon(self: Box<Self>) {
        tracing::warn!(
            message_id = self.message_id(),
            "message handle dropped without being released"
        );
    }
}

/// A received, in-flight message.
///
/// The disposition must be set exactly once via [`set_disposition`](Self::set_disposition)
/// before the handle is [released](Self::release). Releasing without a disposition abandons the
/// message, as does dropping the handle without releasing it.
#[derive(Debug)]
pub struct MessageHandle {
    handler: Option<Box<dyn MessageHandler>>,
    disposition: Option<Disposition>,
}

impl MessageHandle {
    /// Wraps a backend message handler.
    pub fn new(handler: Box<dyn MessageHandler>) -> Self {
        Self {
            handler: Some(handler),
            disposition: None,
        }
    }

    /// The backend-assigned message identifier.
    pub fn message_id(&self) -> &str {
        self.handler.as_ref().map_or("", |h| h.message_id())
    }

    /// The task identifier carried by the message.
    pub fn task_id(&self) -> &str {
        self.handler.as_ref().map_or("", |h| h.task_id())
    }

    /// The disposition set so far, if any.
    pub fn disposition(&self) -> Option<Disposition> {
        self.disposition
    }

    /// Sets the disposition. Fails if it has already been set.
    pub fn set_disposition(&mut self, disposition: Disposition) -> Result<(), DispositionError> {
        if let Some(previous) = self.disposition {
            return Err(DispositionError {
                message_id: self.message_id().to_owned(),
                previous,
                requested: disposition,
            });
        }
        self.disposition = Some(disposition);
        Ok(())
    }

    /// Releases the message to the backend with the disposition set on this handle.
    pub async fn release(mut self) -> BackendResult<()> {
        let Some(handler) = self.handler.take() else {
            return Ok(());
        };
        if self.disposition.is_none() {
            tracing::warn!(
                message_id = handler.message_id(),
                "releasing message without disposition, treating it as abandoned"
            );
        }
        handler.release(self.disposition).await
    }
}

impl Drop for MessageHandle {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abandon();
        }
    }
}

/// Returned when a disposition is set twice on the same [`MessageHandle`].
#[derive(Debug, Error)]
#[error("disposition of `{message_id}` already set to {previous:?}, refusing {requested:?}")]
pub struct DispositionError {
    /// The message whose disposition was set twice.
    pub message_id: String,
    /// The disposition already in place.
    pub previous: Disposition,
    /// The rejected disposition.
    pub requested: Disposition,
}

/// Common lifecycle of every backend client.
#[async_trait::async_trait]
pub trait StorageClient: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Prepares the client. Called once per client before any measured iteration.
    async fn init(&self) -> BackendResult<()>;
}

/// Object storage capability.
#[async_trait::async_trait]
pub trait ObjectStorage: StorageClient {
    /// Stores a new object from the given chunk stream and returns its handle.
    async fn add_or_update(
        &self,
        data: &ObjectData,
        chunks: PayloadStream,
    ) -> BackendResult<ObjectHandle>;

    /// Streams the contents of an object.
    ///
    /// Fails with [`BackendError::NotFound`] if the handle is unknown.
    async fn get_values(&self, handle: &ObjectHandle) -> BackendResult<PayloadStream>;

    /// Looks up the sizes of the given objects. Unknown handles map to `None`.
    async fn get_sizes(&self, handles: &[ObjectHandle]) -> BackendResult<SizeMap>;

    /// Deletes the given objects. Unknown handles are skipped silently.
    async fn try_delete(&self, handles: &[ObjectHandle]) -> BackendResult<()>;
}

/// Push side of a queue.
#[async_trait::async_trait]
pub trait PushQueueStorage: StorageClient {
    /// Appends messages to the given partition.
    async fn push_messages(
        &self,
        messages: Vec<MessageEnvelope>,
        partition: &str,
    ) -> BackendResult<()>;
}

/// Pull side of a queue.
#[async_trait::async_trait]
pub trait PullQueueStorage: StorageClient {
    /// Receives up to `max` messages from the given partition.
    ///
    /// The stream may end early if fewer messages are available.
    async fn pull_messages(&self, partition: &str, max: usize) -> BackendResult<MessageStream>;
}

/// Errors raised by backend adapters.
#[derive(Debug, Error)]
pub enum BackendError {
    /// IO errors related to payload streaming or file operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object does not exist.
    #[error("object `{0}` not found")]
    NotFound(ObjectHandle),

    /// A backend setting could not be interpreted.
    #[error("invalid backend setting `{key}`: {reason}")]
    InvalidSetting {
        /// The offending override key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Any other error stemming from one of the storage backends, which might be specific to that
    /// backend or to a certain operation.
    #[error("storage backend error: {context}")]
    Generic {
        /// What the backend was doing.
        context: String,
        /// The underlying cause.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BackendError {
    /// Creates a [`BackendError::Generic`] from a message.
    pub fn generic(context: impl Into<String>) -> Self {
        let context = context.into();
        Self::Generic {
            cause: context.clone().into(),
            context,
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-erased [`ObjectStorage`] client.
pub type DynObjectStorage = dyn ObjectStorage;
/// A type-erased [`PushQueueStorage`] client.
pub type DynPushQueue = dyn PushQueueStorage;
/// A type-erased [`PullQueueStorage`] client.
pub type DynPullQueue = dyn PullQueueStorage;
