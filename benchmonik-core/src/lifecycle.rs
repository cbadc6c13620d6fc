//! The setup → measured → cleanup lifecycle of one iteration.
//!
//! [`run_iteration`] always traverses all three phases:
//!
//! 1. **Setup** creates the preconditions of the measured operation. It is not timed. If it fails,
//!    the measured phase is skipped.
//! 2. **Measured** runs exactly the operation under test, timed from immediately before to
//!    immediately after. Its failure becomes the iteration's outcome.
//! 3. **Cleanup** removes everything setup and measured created. It runs regardless of how the
//!    previous phases ended, with a fresh cancellation token, and its failures are logged without
//!    replacing the outcome.

use std::fmt;
use std::ops::AddAssign;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::profiling::{MemoryDelta, MemorySampler};

/// Amount of data moved by a measured phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transferred {
    /// Payload bytes uploaded or downloaded.
    pub bytes: u64,
    /// Messages pushed or pulled.
    pub messages: u64,
}

impl Transferred {
    /// A transfer of `bytes` payload bytes.
    pub fn bytes(bytes: u64) -> Self {
        Self { bytes, messages: 0 }
    }

    /// A transfer of `messages` queue messages.
    pub fn messages(messages: u64) -> Self {
        Self { bytes: 0, messages }
    }
}

impl AddAssign for Transferred {
    fn add_assign(&mut self, rhs: Self) {
        self.bytes += rhs.bytes;
        self.messages += rhs.messages;
    }
}

impl std::iter::Sum for Transferred {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, t| {
            acc += t;
            acc
        })
    }
}

/// The lifecycle phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Untimed preparation.
    Setup,
    /// The timed operation under test.
    Measured,
    /// Removal of everything the iteration created.
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Setup => "setup",
            Self::Measured => "measured",
            Self::Cleanup => "cleanup",
        })
    }
}

/// How an iteration ended.
#[derive(Debug)]
pub enum Outcome {
    /// The measured phase succeeded.
    Completed,
    /// Setup or the measured phase failed.
    Failed {
        /// The phase that failed.
        phase: Phase,
        /// Why it failed.
        error: Error,
    },
    /// The iteration was cancelled before the measured phase completed.
    Cancelled,
}

/// The record of one iteration, handed to a [`ResultSink`](crate::driver::ResultSink).
#[derive(Debug)]
pub struct IterationResult {
    /// Zero-based iteration index within its operation, warmups included.
    pub iteration: usize,
    /// Whether this was a warmup iteration.
    pub warmup: bool,
    /// Wall-clock time of the measured phase.
    pub elapsed: Duration,
    /// Data moved by the measured phase.
    pub moved: Transferred,
    /// Change of resident memory across the measured phase, if sampled.
    pub memory: Option<MemoryDelta>,
    /// How the iteration ended.
    pub outcome: Outcome,
}

impl IterationResult {
    /// Returns `true` if the measured phase succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Completed)
    }

    /// Returns the error of a failed iteration.
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Outcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns `true` if the iteration failed because transferred data had the wrong size.
    ///
    /// These are correctness failures, as opposed to performance failures like timeouts.
    pub fn is_correctness_failure(&self) -> bool {
        self.error().is_some_and(Error::is_size_mismatch)
    }
}

/// A benchmark operation with its per-iteration state.
///
/// A fresh workload is created for every iteration so that no state carries over between them.
#[async_trait::async_trait]
pub trait Workload: Send + Sync {
    /// The name of the operation under test.
    fn name(&self) -> &'static str;

    /// Creates the preconditions of the measured phase.
    async fn setup(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Runs the operation under test.
    async fn measured(&self, cancel: &CancellationToken) -> Result<Transferred>;

    /// Removes every artifact created by setup and measured.
    async fn cleanup(&mut self, cancel: &CancellationToken) -> Result<()>;
}

/// Per-iteration options.
#[derive(Debug, Default)]
pub struct IterationOptions {
    /// Zero-based iteration index.
    pub iteration: usize,
    /// Whether this is a warmup iteration.
    pub warmup: bool,
    /// Time budget of the measured phase.
    pub timeout: Option<Duration>,
}

/// Runs one iteration of `workload` through setup, measured and cleanup.
pub async fn run_iteration(
    workload: &mut dyn Workload,
    options: &IterationOptions,
    sampler: Option<&MemorySampler>,
    cancel: &CancellationToken,
) -> IterationResult {
    let name = workload.name();
    let mut result = IterationResult {
        iteration: options.iteration,
        warmup: options.warmup,
        elapsed: Duration::ZERO,
        moved: Transferred::default(),
        memory: None,
        outcome: Outcome::Completed,
    };

    let setup = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = workload.setup(cancel) => result,
        }
    };
    if let Err(error) = setup.instrument(tracing::debug_span!("setup")).await {
        result.outcome = into_outcome(Phase::Setup, error);
    } else {
        let before = sampler.map(MemorySampler::sample);
        let start = Instant::now();
        let measured = measure(&*workload, options.timeout, cancel)
            .instrument(tracing::debug_span!("measured"))
            .await;
        result.elapsed = start.elapsed();
        if let Some(sampler) = sampler {
            result.memory = before.flatten().zip(sampler.sample()).map(MemoryDelta::from);
        }

        match measured {
            Ok(moved) => result.moved = moved,
            Err(error) => result.outcome = into_outcome(Phase::Measured, error),
        }
    }

    // Teardown must not be starved by the cancellation that may have aborted the measured phase.
    let cleanup_cancel = CancellationToken::new();
    if let Err(error) = workload
        .cleanup(&cleanup_cancel)
        .instrument(tracing::debug_span!("cleanup"))
        .await
    {
        tracing::warn!(
            operation = name,
            iteration = options.iteration,
            error = &error as &dyn std::error::Error,
            "cleanup failed"
        );
    }

    match &result.outcome {
        Outcome::Completed => tracing::debug!(
            operation = name,
            iteration = options.iteration,
            warmup = options.warmup,
            elapsed = ?result.elapsed,
            "iteration completed"
        ),
        Outcome::Failed { phase, error } => tracing::debug!(
            operation = name,
            iteration = options.iteration,
            %phase,
            error = error as &dyn std::error::Error,
            "iteration failed"
        ),
        Outcome::Cancelled => tracing::debug!(
            operation = name,
            iteration = options.iteration,
            "iteration cancelled"
        ),
    }

    result
}

async fn measure(
    workload: &dyn Workload,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Transferred> {
    let Some(timeout) = timeout else {
        return workload.measured(cancel).await;
    };

    let measured_cancel = cancel.child_token();
    let measured = workload.measured(&measured_cancel);
    tokio::pin!(measured);

    tokio::select! {
        result = &mut measured => result,
        _ = tokio::time::sleep(timeout) => {
            measured_cancel.cancel();
            // Wait for the runners to wind down so cleanup does not race with them.
            let _ = measured.await;
            Err(Error::TimedOut(timeout))
        }
    }
}

fn into_outcome(phase: Phase, error: Error) -> Outcome {
    if matches!(error, Error::Cancelled) {
        return Outcome::Cancelled;
    }
    if let Error::Runners(aggregate) = &error {
        if aggregate
            .failures
            .iter()
            .all(|(_, e)| matches!(e, Error::Cancelled))
        {
            return Outcome::Cancelled;
        }
    }
    Outcome::Failed { phase, error }
}
