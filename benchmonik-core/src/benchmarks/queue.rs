//! Queue benchmarks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendResult, Disposition, DynPullQueue, DynPushQueue, MessageEnvelope, MessageHandle,
};
use crate::batch::{self, PullOutcome};
use crate::coordinator;
use crate::error::{Error, Result};
use crate::lifecycle::{Transferred, Workload};
use crate::pool::{ClientPool, RunnerSlot};
use crate::scenario::ScenarioParameters;

/// Queue operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOperation {
    /// Pushes messages.
    PushMessages,
    /// Pulls messages pushed during setup and marks them processed.
    PullMessagesAck,
    /// Pulls messages pushed during setup and marks them cancelled.
    PullMessagesNack,
    /// All runners push, then all runners pull.
    PushThenPull,
    /// Every runner pushes and then pulls on its own.
    PushThenPullPerRunner,
}

impl QueueOperation {
    /// All queue operations in reporting order.
    pub const ALL: [Self; 5] = [
        Self::PushMessages,
        Self::PullMessagesAck,
        Self::PullMessagesNack,
        Self::PushThenPull,
        Self::PushThenPullPerRunner,
    ];

    /// The name used in configuration files and reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::PushMessages => "PushMessages",
            Self::PullMessagesAck => "PullMessagesAck",
            Self::PullMessagesNack => "PullMessagesNack",
            Self::PushThenPull => "PushThenPull",
            Self::PushThenPullPerRunner => "PushThenPullPerRunner",
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Queue-side settings that do not vary across scenarios.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    /// Base name of the partitions.
    pub partition: String,
    /// Whether all runners share the base partition instead of using one partition each.
    pub shared_partition: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            partition: "benchmonik".into(),
            shared_partition: false,
        }
    }
}

impl QueueSettings {
    /// The partition used by the given runner.
    pub fn partition_for(&self, slot: RunnerSlot) -> String {
        if self.shared_partition {
            self.partition.clone()
        } else {
            format!("{}-{}", self.partition, slot.index())
        }
    }
}

/// Everything one runner needs, owned so it can move into a spawned task.
#[derive(Clone)]
struct RunnerContext {
    slot: RunnerSlot,
    push: Arc<DynPushQueue>,
    pull: Arc<DynPullQueue>,
    partition: String,
    session_id: String,
    messages: usize,
    max_per_call: usize,
    pushed: Arc<AtomicUsize>,
}

impl RunnerContext {
    fn envelopes(&self) -> Vec<MessageEnvelope> {
        (0..self.messages)
            .map(|index| MessageEnvelope {
                task_id: format!("{}-task-{index}", self.slot),
                session_id: self.session_id.clone(),
                options: BTreeMap::new(),
            })
            .collect()
    }

    async fn push(self) -> Result<Transferred> {
        let progress = batch::execute_batched(self.envelopes(), self.max_per_call, |batch| {
            let client = Arc::clone(&self.push);
            let partition = self.partition.clone();
            let pushed = Arc::clone(&self.pushed);
            async move {
                let len = batch.len();
                client.push_messages(batch, &partition).await?;
                pushed.fetch_add(len, Ordering::Relaxed);
                BackendResult::Ok(())
            }
        })
        .await?;
        Ok(Transferred::messages(progress.applied as u64))
    }

    async fn pull(self, disposition: Disposition) -> Result<Transferred> {
        let outcome =
            pull_messages(&self.pull, &self.partition, self.messages, self.max_per_call).await;
        let (handles, error) = match outcome {
            Ok(PullOutcome { items, .. }) => (items, None),
            Err((items, error)) => (items, Some(error)),
        };

        let pulled = handles.len() as u64;
        let released = settle(handles, disposition).await;
        if let Some(error) = error {
            return Err(error);
        }
        released?;
        Ok(Transferred::messages(pulled))
    }

    async fn push_then_pull(self, disposition: Disposition) -> Result<Transferred> {
        let mut moved = self.clone().push().await?;
        moved += self.pull(disposition).await?;
        Ok(moved)
    }
}

/// Pulls up to `total` messages from `partition` in calls of at most `max_per_call` messages.
async fn pull_messages(
    client: &Arc<DynPullQueue>,
    partition: &str,
    total: usize,
    max_per_call: usize,
) -> Result<PullOutcome<MessageHandle>, (Vec<MessageHandle>, Error)> {
    batch::pull_batched(total, max_per_call, |request| {
        let client = Arc::clone(client);
        let partition = partition.to_owned();
        async move { receive(&client, &partition, request).await }
    })
    .await
}

async fn receive(
    client: &Arc<DynPullQueue>,
    partition: &str,
    request: usize,
) -> BackendResult<Vec<MessageHandle>> {
    let mut stream = client.pull_messages(partition, request).await?.take(request);
    let mut handles = Vec::with_capacity(request);
    while let Some(next) = stream.next().await {
        match next {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                // Messages received before the failure go back to the queue.
                let releases = handles.into_iter().map(MessageHandle::release);
                for result in futures::future::join_all(releases).await {
                    if let Err(release_err) = result {
                        tracing::warn!(
                            error = &release_err as &dyn std::error::Error,
                            "failed to requeue message after a broken pull"
                        );
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(handles)
}

/// Sets `disposition` on every handle and releases all of them concurrently.
async fn settle(handles: Vec<MessageHandle>, disposition: Disposition) -> Result<()> {
    let mut first_error = None;
    let mut releases = Vec::with_capacity(handles.len());
    for mut handle in handles {
        if let Err(error) = handle.set_disposition(disposition) {
            first_error.get_or_insert(Error::from(error));
        }
        releases.push(handle.release());
    }

    for result in futures::future::join_all(releases).await {
        if let Err(error) = result {
            first_error.get_or_insert(Error::operation("releasing message", error));
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// One iteration of a queue operation.
pub struct QueueWorkload {
    operation: QueueOperation,
    push: Arc<ClientPool<DynPushQueue>>,
    pull: Arc<ClientPool<DynPullQueue>>,
    settings: QueueSettings,
    messages: usize,
    max_per_call: usize,
    session_id: String,
    pushed: Vec<Arc<AtomicUsize>>,
}

impl QueueWorkload {
    /// Prepares an iteration of `operation`.
    ///
    /// Both pools must hold one client per runner, index-aligned.
    pub fn new(
        operation: QueueOperation,
        push: Arc<ClientPool<DynPushQueue>>,
        pull: Arc<ClientPool<DynPullQueue>>,
        parameters: &ScenarioParameters,
        settings: QueueSettings,
    ) -> Self {
        let runners = push.len().min(pull.len());
        Self {
            operation,
            push,
            pull,
            settings,
            messages: parameters.message_count as usize,
            max_per_call: parameters.max_items_per_operation as usize,
            session_id: format!("benchmonik-{}", uuid::Uuid::new_v4().simple()),
            pushed: (0..runners).map(|_| Arc::new(AtomicUsize::new(0))).collect(),
        }
    }

    /// Number of messages pushed so far by this iteration, across all runners.
    pub fn pushed(&self) -> usize {
        self.pushed.iter().map(|p| p.load(Ordering::Relaxed)).sum()
    }

    fn runners(&self) -> usize {
        self.pushed.len()
    }

    fn context(&self, slot: RunnerSlot) -> RunnerContext {
        RunnerContext {
            slot,
            push: self.push.client(slot),
            pull: self.pull.client(slot),
            partition: self.settings.partition_for(slot),
            session_id: self.session_id.clone(),
            messages: self.messages,
            max_per_call: self.max_per_call,
            pushed: Arc::clone(&self.pushed[slot.index()]),
        }
    }

    async fn push_all(&self, cancel: &CancellationToken) -> Result<Transferred> {
        let moved =
            coordinator::run(self.runners(), cancel, |slot| self.context(slot).push()).await?;
        Ok(moved.into_iter().sum())
    }

    async fn pull_all(
        &self,
        cancel: &CancellationToken,
        disposition: Disposition,
    ) -> Result<Transferred> {
        let moved = coordinator::run(self.runners(), cancel, |slot| {
            self.context(slot).pull(disposition)
        })
        .await?;
        Ok(moved.into_iter().sum())
    }

    /// Drains the partition of `slot` with `Cancelled`, up to `budget` messages.
    async fn drain(&self, slot: RunnerSlot, budget: usize) -> Result<usize> {
        let client = self.pull.client(slot);
        let partition = self.settings.partition_for(slot);
        let pulled = pull_messages(&client, &partition, budget, self.max_per_call).await;
        let (handles, error) = match pulled {
            Ok(outcome) => (outcome.items, None),
            Err((items, error)) => (items, Some(error)),
        };
        let drained = handles.len();
        settle(handles, Disposition::Cancelled).await?;
        error.map_or(Ok(drained), Err)
    }
}

impl fmt::Debug for QueueWorkload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWorkload")
            .field("operation", &self.operation)
            .field("settings", &self.settings)
            .field("messages", &self.messages)
            .field("max_per_call", &self.max_per_call)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Workload for QueueWorkload {
    fn name(&self) -> &'static str {
        self.operation.name()
    }

    async fn setup(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.operation {
            QueueOperation::PullMessagesAck | QueueOperation::PullMessagesNack => {
                self.push_all(cancel).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn measured(&self, cancel: &CancellationToken) -> Result<Transferred> {
        match self.operation {
            QueueOperation::PushMessages => self.push_all(cancel).await,
            QueueOperation::PullMessagesAck => self.pull_all(cancel, Disposition::Processed).await,
            QueueOperation::PullMessagesNack => self.pull_all(cancel, Disposition::Cancelled).await,
            QueueOperation::PushThenPull => {
                let mut moved = self.push_all(cancel).await?;
                moved += self.pull_all(cancel, Disposition::Processed).await?;
                Ok(moved)
            }
            QueueOperation::PushThenPullPerRunner => {
                let moved = coordinator::run(self.runners(), cancel, |slot| {
                    self.context(slot).push_then_pull(Disposition::Processed)
                })
                .await?;
                Ok(moved.into_iter().sum())
            }
        }
    }

    async fn cleanup(&mut self, _cancel: &CancellationToken) -> Result<()> {
        let mut budgets: BTreeMap<String, (RunnerSlot, usize)> = BTreeMap::new();
        for slot in RunnerSlot::range(self.runners()) {
            let pushed = self.pushed[slot.index()].load(Ordering::Relaxed);
            if pushed == 0 {
                continue;
            }
            let entry = budgets
                .entry(self.settings.partition_for(slot))
                .or_insert((slot, 0));
            entry.1 += pushed;
        }

        let mut first_error = None;
        for (partition, (slot, budget)) in budgets {
            match self.drain(slot, budget).await {
                Ok(0) => {}
                Ok(drained) => tracing::debug!(%partition, drained, "drained leftover messages"),
                Err(error) => {
                    tracing::warn!(
                        %partition,
                        error = &error as &dyn std::error::Error,
                        "failed to drain partition"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
