//! One initialized backend client per runner slot.
//!
//! A [`ClientPool`] is created once per scenario and reused for every iteration of it. Clients
//! are never re-initialized mid-run, and a pool is either complete or not created at all.

use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use futures_util::future::try_join_all;

use crate::backend::{BackendResult, StorageClient};
use crate::error::{Error, Result};

/// Index of a concurrent runner, `0..concurrent_runners`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunnerSlot(usize);

impl RunnerSlot {
    /// Creates the slot with the given index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The index of this slot.
    pub const fn index(self) -> usize {
        self.0
    }

    /// Returns the slots `0..count` in order.
    pub fn range(count: usize) -> impl ExactSizeIterator<Item = RunnerSlot> {
        (0..count).map(RunnerSlot)
    }
}

impl fmt::Display for RunnerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner-{}", self.0)
    }
}

/// The kind of backend client held by a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// [`ObjectStorage`](crate::backend::ObjectStorage) clients.
    ObjectStorage,
    /// [`PullQueueStorage`](crate::backend::PullQueueStorage) clients.
    PullQueue,
    /// [`PushQueueStorage`](crate::backend::PushQueueStorage) clients.
    PushQueue,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ObjectStorage => "object storage",
            Self::PullQueue => "pull queue",
            Self::PushQueue => "push queue",
        })
    }
}

/// Initialized clients, index-aligned with [`RunnerSlot`]s.
pub struct ClientPool<C: ?Sized> {
    capability: Capability,
    clients: Vec<Arc<C>>,
}

impl<C> ClientPool<C>
where
    C: StorageClient + ?Sized,
{
    /// Creates `count` clients with `factory` and initializes each of them.
    ///
    /// Any failing construction or initialization fails the whole pool.
    pub async fn acquire<F>(capability: Capability, count: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut(RunnerSlot) -> BackendResult<Arc<C>>,
    {
        let clients = RunnerSlot::range(count)
            .map(|slot| {
                factory(slot).map_err(|source| Error::Initialization {
                    capability,
                    slot,
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        try_join_all(clients.iter().enumerate().map(|(index, client)| async move {
            client
                .init()
                .await
                .map_err(|source| Error::Initialization {
                    capability,
                    slot: RunnerSlot::new(index),
                    source,
                })
        }))
        .await?;

        tracing::debug!(%capability, count, "initialized client pool");
        Ok(Self {
            capability,
            clients,
        })
    }

    /// The capability of the pooled clients.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// The number of pooled clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` if the pool holds no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Returns a shared reference to the client of the given slot.
    pub fn client(&self, slot: RunnerSlot) -> Arc<C> {
        Arc::clone(&self.clients[slot.index()])
    }

    /// Iterates over the slots and their clients in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (RunnerSlot, &Arc<C>)> {
        self.clients
            .iter()
            .enumerate()
            .map(|(index, client)| (RunnerSlot::new(index), client))
    }
}

impl<C: ?Sized> Index<RunnerSlot> for ClientPool<C> {
    type Output = Arc<C>;

    fn index(&self, slot: RunnerSlot) -> &Self::Output {
        &self.clients[slot.index()]
    }
}

impl<C: ?Sized> fmt::Debug for ClientPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("capability", &self.capability)
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::BackendError;

    #[derive(Debug)]
    struct Counting {
        inits: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl StorageClient for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn init(&self) -> BackendResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BackendError::generic("refused"));
            }
            Ok(())
        }
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            inits: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn initializes_every_client_once() {
        let pool = ClientPool::acquire(Capability::ObjectStorage, 4, |_| Ok(counting(false)))
            .await
            .unwrap();

        assert_eq!(pool.len(), 4);
        for (_, client) in pool.iter() {
            assert_eq!(client.inits.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn slots_are_index_aligned() {
        let created = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pool = ClientPool::acquire(Capability::PushQueue, 3, |slot| {
            created.lock().unwrap().push(slot);
            Ok(counting(false))
        })
        .await
        .unwrap();

        assert_eq!(
            *created.lock().unwrap(),
            [RunnerSlot::new(0), RunnerSlot::new(1), RunnerSlot::new(2)]
        );
        assert!(Arc::ptr_eq(&pool[RunnerSlot::new(2)], &pool.client(RunnerSlot::new(2))));
    }

    #[tokio::test]
    async fn failing_init_fails_the_pool() {
        let result = ClientPool::acquire(Capability::PullQueue, 3, |slot| {
            Ok(counting(slot.index() == 1))
        })
        .await;

        match result {
            Err(Error::Initialization {
                capability, slot, ..
            }) => {
                assert_eq!(capability, Capability::PullQueue);
                assert_eq!(slot, RunnerSlot::new(1));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_factory_fails_the_pool() {
        let result = ClientPool::<Counting>::acquire(Capability::ObjectStorage, 2, |slot| {
            if slot.index() == 0 {
                Ok(counting(false))
            } else {
                Err(BackendError::generic("no connection"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Initialization { .. })));
    }
}
