//! Named backend factories.
//!
//! A [`Registry`] maps a component name, as given in a scenario file, to a factory that creates
//! one client per runner slot. Lookups ignore ASCII case.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::backend::in_memory::{InMemoryBroker, InMemoryObjectStorage};
use crate::backend::local_fs::LocalFsObjectStorage;
use crate::backend::{BackendError, BackendResult, DynObjectStorage, DynPullQueue, DynPushQueue};
use crate::error::{Error, Result};
use crate::pool::{Capability, RunnerSlot};
use crate::scenario::ScenarioParameters;

/// Everything a factory may use to configure a client.
#[derive(Clone, Copy, Debug)]
pub struct FactoryContext<'a> {
    /// The scenario the clients are created for.
    pub parameters: &'a ScenarioParameters,
    /// Backend-specific overrides from the scenario file.
    pub overrides: &'a BTreeMap<String, String>,
    /// Directory for backends that store data locally.
    pub backend_root: Option<&'a Path>,
}

impl FactoryContext<'_> {
    /// Returns the override for `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Parses the override for `key`, falling back to `default` if it is not set.
    pub fn parse<T>(&self, key: &str, default: T) -> BackendResult<T>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(value) => value.parse().map_err(|e: T::Err| BackendError::InvalidSetting {
                key: key.into(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }
}

/// Creates object storage clients.
pub trait ObjectStorageFactory: Send + Sync {
    /// Creates the client of one runner slot.
    fn create(
        &self,
        context: &FactoryContext<'_>,
        slot: RunnerSlot,
    ) -> BackendResult<Arc<DynObjectStorage>>;
}

impl<F> ObjectStorageFactory for F
where
    F: Fn(&FactoryContext<'_>, RunnerSlot) -> BackendResult<Arc<DynObjectStorage>> + Send + Sync,
{
    fn create(
        &self,
        context: &FactoryContext<'_>,
        slot: RunnerSlot,
    ) -> BackendResult<Arc<DynObjectStorage>> {
        self(context, slot)
    }
}

/// Creates both sides of a queue.
pub trait QueueFactory: Send + Sync {
    /// Creates the push client of one runner slot.
    fn create_push(
        &self,
        context: &FactoryContext<'_>,
        slot: RunnerSlot,
    ) -> BackendResult<Arc<DynPushQueue>>;

    /// Creates the pull client of one runner slot.
    fn create_pull(
        &self,
        context: &FactoryContext<'_>,
        slot: RunnerSlot,
    ) -> BackendResult<Arc<DynPullQueue>>;
}

/// A registered backend.
#[derive(Clone)]
pub enum Component {
    /// An object storage backend.
    ObjectStorage(Arc<dyn ObjectStorageFactory>),
    /// A queue backend.
    Queue(Arc<dyn QueueFactory>),
}

impl Component {
    /// The primary capability of the component.
    pub fn capability(&self) -> Capability {
        match self {
            Self::ObjectStorage(_) => Capability::ObjectStorage,
            Self::Queue(_) => Capability::PushQueue,
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectStorage(_) => f.write_str("Component::ObjectStorage"),
            Self::Queue(_) => f.write_str("Component::Queue"),
        }
    }
}

/// Component names mapped to their factories.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    components: HashMap<String, Component>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in backends `memory`, `localstorage` and `memory-queue`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_object_storage("memory", InMemoryObjectStorage::default());
        registry.register_object_storage("localstorage", LocalStorageFactory::default());
        registry.register_queue("memory-queue", InMemoryBroker::new());
        registry
    }

    /// Registers an object storage backend, replacing any component of the same name.
    pub fn register_object_storage(
        &mut self,
        name: &str,
        factory: impl ObjectStorageFactory + 'static,
    ) -> &mut Self {
        let component = Component::ObjectStorage(Arc::new(factory));
        self.components.insert(name.to_ascii_lowercase(), component);
        self
    }

    /// Registers a queue backend, replacing any component of the same name.
    pub fn register_queue(
        &mut self,
        name: &str,
        factory: impl QueueFactory + 'static,
    ) -> &mut Self {
        let component = Component::Queue(Arc::new(factory));
        self.components.insert(name.to_ascii_lowercase(), component);
        self
    }

    /// Looks up a component by name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Result<&Component> {
        self.components
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::UnknownComponent(name.to_owned()))
    }

    /// The registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.components.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// `memory`: clients share one store and download in chunks of `chunk_download_size`.
impl ObjectStorageFactory for InMemoryObjectStorage {
    fn create(
        &self,
        context: &FactoryContext<'_>,
        _slot: RunnerSlot,
    ) -> BackendResult<Arc<DynObjectStorage>> {
        let chunk_size = context.parameters.chunk_download_size as usize;
        Ok(Arc::new(self.with_chunk_size(chunk_size)))
    }
}

/// `localstorage`: files below the `root` override, the backend root, or a temporary directory.
///
/// The `sync` override (default `true`) controls whether every upload is flushed to disk.
#[derive(Debug, Default)]
struct LocalStorageFactory {
    fallback: Mutex<Option<TempDir>>,
}

impl LocalStorageFactory {
    fn root(&self, context: &FactoryContext<'_>) -> BackendResult<PathBuf> {
        if let Some(root) = context.get("root") {
            return Ok(PathBuf::from(root));
        }
        if let Some(root) = context.backend_root {
            return Ok(root.to_owned());
        }

        let mut fallback = self.fallback.lock().unwrap();
        if let Some(dir) = fallback.as_ref() {
            return Ok(dir.path().to_owned());
        }
        let dir = tempfile::Builder::new().prefix("benchmonik-").tempdir()?;
        let root = dir.path().to_owned();
        tracing::info!(root = %root.display(), "storing objects in temporary directory");
        *fallback = Some(dir);
        Ok(root)
    }
}

impl ObjectStorageFactory for LocalStorageFactory {
    fn create(
        &self,
        context: &FactoryContext<'_>,
        _slot: RunnerSlot,
    ) -> BackendResult<Arc<DynObjectStorage>> {
        let root = self.root(context)?;
        let chunk_size = context.parameters.chunk_download_size as usize;
        let sync = context.parse("sync", true)?;
        Ok(Arc::new(LocalFsObjectStorage::new(&root, chunk_size).with_sync(sync)))
    }
}

/// `memory-queue`: clients share one broker.
impl QueueFactory for InMemoryBroker {
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
