use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::{BackendError, DispositionError};
use crate::pool::{Capability, RunnerSlot};

/// Errors produced while orchestrating benchmarks.
#[derive(Debug, Error)]
pub enum Error {
    /// A scenario definition is missing values or contradicts itself.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The requested backend component is not registered.
    #[error("unknown component `{0}`")]
    UnknownComponent(String),

    /// A component was registered for a different capability than the one requested.
    #[error("component `{component}` does not provide {capability}")]
    UnsupportedCapability {
        /// Registry key of the component.
        component: String,
        /// The capability that was requested.
        capability: Capability,
    },

    /// A backend client could not be created or initialized.
    #[error("failed to initialize {capability} client for {slot}")]
    Initialization {
        /// The capability of the failing client.
        capability: Capability,
        /// The runner slot the client was meant for.
        slot: RunnerSlot,
        /// The backend failure.
        #[source]
        source: BackendError,
    },

    /// A reassembled or reported payload size differs from what was uploaded.
    #[error("transfer size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The size of the original payload.
        expected: u64,
        /// The size observed after the transfer.
        actual: u64,
    },

    /// A backend call failed.
    #[error("{context} failed")]
    Operation {
        /// What was being done.
        context: String,
        /// The backend failure.
        #[source]
        source: BackendError,
    },

    /// A batched operation failed after applying part of its items.
    #[error("batched operation failed after {applied} of {requested} items")]
    Batch {
        /// Items applied by the calls that succeeded.
        applied: usize,
        /// Items the batch was asked to apply.
        requested: usize,
        /// The failure of the call that stopped the batch.
        #[source]
        source: BackendError,
    },

    /// A message disposition was set more than once.
    #[error(transparent)]
    Disposition(#[from] DispositionError),

    /// One or more concurrent runners failed.
    #[error(transparent)]
    Runners(#[from] AggregateRunnerFailure),

    /// A runner task panicked.
    #[error("runner task panicked: {0}")]
    RunnerPanicked(String),

    /// The operation observed a cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The measured phase exceeded its time budget.
    #[error("measured phase timed out after {0:?}")]
    TimedOut(Duration),
}

impl Error {
    /// Wraps a backend failure with a description of the failed call.
    pub fn operation(context: impl Into<String>, source: BackendError) -> Self {
        Self::Operation {
            context: context.into(),
            source,
        }
    }

    /// Returns `true` if this error, or any runner error it aggregates, is a
    /// [`SizeMismatch`](Self::SizeMismatch).
    pub fn is_size_mismatch(&self) -> bool {
        match self {
            Self::SizeMismatch { .. } => true,
            Self::Runners(aggregate) => aggregate
                .failures
                .iter()
                .any(|(_, e)| e.is_size_mismatch()),
            _ => false,
        }
    }

    /// Returns `true` if this error was caused by cancellation or a timeout.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled | Self::TimedOut(_) => true,
            Self::Runners(aggregate) => aggregate
                .failures
                .iter()
                .all(|(_, e)| e.is_cancellation()),
            _ => false,
        }
    }
}

/// All failures of one coordinated run, one entry per failing runner slot.
#[derive(Debug)]
pub struct AggregateRunnerFailure {
    /// The failing slots and their errors, ordered by slot.
    pub failures: Vec<(RunnerSlot, Error)>,
}

impl fmt::Display for AggregateRunnerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} runner(s) failed", self.failures.len())?;
        for (slot, error) in &self.failures {
            write!(f, "; {slot}: {error}")?;
            let mut source = std::error::Error::source(error);
            while let Some(cause) = source {
                write!(f, ": {cause}")?;
                source = cause.source();
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateRunnerFailure {}

/// Result type for orchestration.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_slot() {
        let failure = AggregateRunnerFailure {
            failures: vec![
                (RunnerSlot::new(0), Error::Cancelled),
                (
                    RunnerSlot::new(3),
                    Error::operation("pushing messages", BackendError::generic("broker gone")),
                ),
            ],
        };

        let message = failure.to_string();
        assert!(message.starts_with("2 runner(s) failed"));
        assert!(message.contains("runner-0: operation cancelled"));
        assert!(message.contains("runner-3: pushing messages failed"));
        assert!(message.contains("broker gone"));
    }

    #[test]
    fn size_mismatch_is_found_inside_aggregate() {
        let error = Error::Runners(AggregateRunnerFailure {
            failures: vec![
                (RunnerSlot::new(1), Error::Cancelled),
                (
                    RunnerSlot::new(2),
                    Error::SizeMismatch {
                        expected: 4,
                        actual: 2,
                    },
                ),
            ],
        });
        assert!(error.is_size_mismatch());
        assert!(!error.is_cancellation());
    }
}
