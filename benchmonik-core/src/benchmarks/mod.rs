//! The concrete benchmark operations.
//!
//! Each operation is a [`Workload`](crate::lifecycle::Workload) that is created fresh for every
//! iteration. Object storage operations live in [`object`], queue operations in [`queue`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::backend::ObjectHandle;
use crate::error::Error;
use crate::pool::{Capability, RunnerSlot};

pub mod object;
pub mod queue;

pub use object::{ObjectOperation, ObjectWorkload, Shape};
pub use queue::{QueueOperation, QueueWorkload};

/// Any benchmark operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// An object storage operation.
    Object(ObjectOperation),
    /// A queue operation.
    Queue(QueueOperation),
}

impl Operation {
    /// The name used in configuration files and reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::Object(operation) => operation.name(),
            Self::Queue(operation) => operation.name(),
        }
    }

    /// The capability the operation exercises. Queue operations need both queue sides.
    pub fn capability(self) -> Capability {
        match self {
            Self::Object(_) => Capability::ObjectStorage,
            Self::Queue(_) => Capability::PushQueue,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = Error;

    /// Parses an operation name, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let object = ObjectOperation::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(s))
            .map(Self::Object);
        let queue = || {
            QueueOperation::ALL
                .into_iter()
                .find(|op| op.name().eq_ignore_ascii_case(s))
                .map(Self::Queue)
        };
        object
            .or_else(queue)
            .ok_or_else(|| Error::Configuration(format!("unknown operation `{s}`")))
    }
}

/// Handles created during an iteration, remembered until its cleanup.
///
/// Runners append concurrently; the single cleanup phase drains everything at once.
#[derive(Clone, Debug, Default)]
pub struct CleanupTracker {
    handles: Arc<Mutex<Vec<(RunnerSlot, ObjectHandle)>>>,
}

impl CleanupTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a handle created by the given runner.
    pub fn track(&self, slot: RunnerSlot, handle: ObjectHandle) {
        self.handles.lock().unwrap().push((slot, handle));
    }

    /// Returns the number of tracked handles.
    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Returns `true` if no handles are tracked.
    pub fn is_empty(&self) -> bool {
        self.handles.lock().unwrap().is_empty()
    }

    /// Removes all tracked handles, grouped by the runner that created them.
    pub fn drain(&self) -> BTreeMap<RunnerSlot, Vec<ObjectHandle>> {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let mut grouped: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for (slot, handle) in handles {
            grouped.entry(slot).or_default().push(handle);
        }
        grouped
    }
}
