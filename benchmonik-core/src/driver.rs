//! Top-level sequencing of a benchmark plan.
//!
//! For every scenario of a [`BenchmarkPlan`], the [`Driver`] acquires the client pools once, then
//! runs the warmup and measured iterations of every operation and hands each
//! [`IterationResult`] to a [`ResultSink`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::benchmarks::queue::QueueSettings;
use crate::benchmarks::{
    ObjectOperation, ObjectWorkload, Operation, QueueOperation, QueueWorkload, Shape,
};
use crate::error::{Error, Result};
use crate::lifecycle::{IterationOptions, IterationResult, Workload, run_iteration};
use crate::payload;
use crate::pool::{Capability, ClientPool};
use crate::profiling::MemorySampler;
use crate::registry::{Component, FactoryContext, Registry};
use crate::scenario::{ParameterSpace, ScenarioParameters};

/// Run-wide settings of the driver.
#[derive(Clone, Debug)]
pub struct DriverSettings {
    /// Iterations per operation that are run but flagged as warmup.
    pub warmup_iterations: usize,
    /// Measured iterations per operation.
    pub iterations: usize,
    /// Time budget of every measured phase.
    pub measured_timeout: Option<Duration>,
    /// Partition naming of queue benchmarks.
    pub queue: QueueSettings,
    /// Whether to sample resident memory around every measured phase.
    pub profile_memory: bool,
    /// Directory for backends that store data locally.
    pub backend_root: Option<PathBuf>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            warmup_iterations: 1,
            iterations: 12,
            measured_timeout: None,
            queue: QueueSettings::default(),
            profile_memory: false,
            backend_root: None,
        }
    }
}

/// What to benchmark: one component over a parameter space.
#[derive(Clone, Debug)]
pub struct BenchmarkPlan {
    /// Registry key of the backend.
    pub component: String,
    /// Operations to run per scenario. Empty means all operations of the component.
    pub operations: Vec<Operation>,
    /// Shape of object storage benchmarks.
    pub shape: Shape,
    /// The scenarios.
    pub space: ParameterSpace,
    /// Backend-specific overrides.
    pub overrides: BTreeMap<String, String>,
}

/// Identifies the scenario an iteration belongs to.
#[derive(Clone, Debug)]
pub struct ScenarioInfo {
    /// Registry key of the backend.
    pub component: String,
    /// Zero-based position in the parameter space.
    pub index: usize,
    /// Number of scenarios in the parameter space.
    pub total: usize,
    /// The parameters of the scenario.
    pub parameters: ScenarioParameters,
}

/// Consumer of iteration results.
pub trait ResultSink: Send {
    /// Called before the first iteration of a scenario.
    fn scenario_started(&mut self, _scenario: &ScenarioInfo) {}

    /// Called once per iteration, warmups included.
    fn record(&mut self, scenario: &ScenarioInfo, operation: Operation, result: IterationResult);

    /// Called after the last iteration of a scenario.
    fn scenario_finished(&mut self, _scenario: &ScenarioInfo) {}
}

/// An iteration result together with where it came from.
#[derive(Debug)]
pub struct RecordedIteration {
    /// Index of the scenario.
    pub scenario: usize,
    /// The operation.
    pub operation: Operation,
    /// The result.
    pub result: IterationResult,
}

impl ResultSink for Vec<RecordedIteration> {
    fn record(&mut self, scenario: &ScenarioInfo, operation: Operation, result: IterationResult) {
        self.push(RecordedIteration {
            scenario: scenario.index,
            operation,
            result,
        });
    }
}

/// Counters of a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Scenarios started.
    pub scenarios: usize,
    /// Iterations run, warmups included.
    pub iterations: usize,
    /// Iterations that failed or were cancelled.
    pub failures: usize,
    /// Failed iterations caused by size mismatches.
    pub correctness_failures: usize,
    /// Whether the run was cut short by cancellation.
    pub cancelled: bool,
}

/// Runs benchmark plans against registered backends.
#[derive(Debug)]
pub struct Driver {
    registry: Registry,
    settings: DriverSettings,
    sampler: Option<Arc<MemorySampler>>,
}

impl Driver {
    /// Creates a driver.
    pub fn new(registry: Registry, settings: DriverSettings) -> Self {
        let sampler = if settings.profile_memory {
            MemorySampler::new().map(Arc::new)
        } else {
            None
        };
        Self {
            registry,
            settings,
            sampler,
        }
    }

    /// The registry backends are looked up in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs every scenario of `plan`.
    ///
    /// Configuration errors fail before the first scenario. A client pool that cannot be
    /// initialized aborts the remaining scenarios. Iteration failures only show up in the results.
    pub async fn run(
        &self,
        plan: &BenchmarkPlan,
        sink: &mut dyn ResultSink,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        plan.space.validate()?;
        if self.settings.iterations == 0 {
            return Err(Error::Configuration("iterations must be positive".into()));
        }
        let component = self.registry.get(&plan.component)?.clone();
        let operations = resolve_operations(&plan.component, &component, &plan.operations)?;

        let mut summary = RunSummary::default();
        let total = plan.space.len();
        for (index, parameters) in plan.space.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            parameters.validate()?;

            let scenario = ScenarioInfo {
                component: plan.component.clone(),
                index,
                total,
                parameters,
            };
            let span = tracing::info_span!("scenario", component = %plan.component, index);
            let run = self.run_scenario(
                plan,
                &component,
                &operations,
                &scenario,
                sink,
                cancel,
                &mut summary,
            );
            run.instrument(span).await?;
        }

        summary.cancelled = cancel.is_cancelled();
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_scenario(
        &self,
        plan: &BenchmarkPlan,
        component: &Component,
        operations: &[Operation],
        scenario: &ScenarioInfo,
        sink: &mut dyn ResultSink,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let parameters = &scenario.parameters;
        let context = FactoryContext {
            parameters,
            overrides: &plan.overrides,
            backend_root: self.settings.backend_root.as_deref(),
        };
        tracing::info!(
            scenario = scenario.index + 1,
            of = scenario.total,
            %parameters,
            "starting scenario"
        );

        let mut run = OperationRun {
            driver: self,
            scenario,
            sink,
            cancel,
            summary,
        };
        run.summary.scenarios += 1;
        run.sink.scenario_started(scenario);

        match component {
            Component::ObjectStorage(factory) => {
                let runners = plan.shape.runners(parameters);
                let pool = ClientPool::acquire(Capability::ObjectStorage, runners, |slot| {
                    factory.create(&context, slot)
                })
                .await
                .inspect_err(log_initialization_error)?;
                let pool = Arc::new(pool);
                let payload = payload::generate(parameters.payload_size);

                for operation in operations {
                    let Operation::Object(operation) = *operation else {
                        continue;
                    };
                    run.operation(Operation::Object(operation), || -> Box<dyn Workload> {
                        Box::new(ObjectWorkload::new(
                            operation,
                            plan.shape,
                            Arc::clone(&pool),
                            parameters,
                            payload.clone(),
                        ))
                    })
                    .await;
                }
            }
            Component::Queue(factory) => {
                let runners = parameters.runners();
                let push = ClientPool::acquire(Capability::PushQueue, runners, |slot| {
                    factory.create_push(&context, slot)
                })
                .await
                .inspect_err(log_initialization_error)?;
                let pull = ClientPool::acquire(Capability::PullQueue, runners, |slot| {
                    factory.create_pull(&context, slot)
                })
                .await
                .inspect_err(log_initialization_error)?;
                let (push, pull) = (Arc::new(push), Arc::new(pull));

                for operation in operations {
                    let Operation::Queue(operation) = *operation else {
                        continue;
                    };
                    run.operation(Operation::Queue(operation), || -> Box<dyn Workload> {
                        Box::new(QueueWorkload::new(
                            operation,
                            Arc::clone(&push),
                            Arc::clone(&pull),
                            parameters,
                            self.settings.queue.clone(),
                        ))
                    })
                    .await;
                }
            }
        }

        run.sink.scenario_finished(scenario);
        Ok(())
    }
}

/// The iterations of one scenario.
struct OperationRun<'a> {
    driver: &'a Driver,
    scenario: &'a ScenarioInfo,
    sink: &'a mut dyn ResultSink,
    cancel: &'a CancellationToken,
    summary: &'a mut RunSummary,
}

impl OperationRun<'_> {
    async fn operation<F>(&mut self, operation: Operation, mut workload: F)
    where
        F: FnMut() -> Box<dyn Workload>,
    {
        let settings = &self.driver.settings;
        let sampler = self.driver.sampler.as_deref();
        let total = settings.warmup_iterations + settings.iterations;
        tracing::info!(%operation, iterations = settings.iterations, "starting operation");

        let mut failures = 0;
        for iteration in 0..total {
            if self.cancel.is_cancelled() {
                tracing::info!(%operation, iteration, "run cancelled");
                break;
            }

            let options = IterationOptions {
                iteration,
                warmup: iteration < settings.warmup_iterations,
                timeout: settings.measured_timeout,
            };
            let mut workload = workload();
            let result = run_iteration(workload.as_mut(), &options, sampler, self.cancel)
                .instrument(tracing::debug_span!("iteration", %operation, iteration))
                .await;

            self.summary.iterations += 1;
            if !result.is_success() {
                failures += 1;
                self.summary.failures += 1;
            }
            if result.is_correctness_failure() {
                self.summary.correctness_failures += 1;
            }
            self.sink.record(self.scenario, operation, result);
        }

        tracing::info!(%operation, failures, "finished operation");
    }
}

fn log_initialization_error(error: &Error) {
    tracing::error!(
        error = error as &dyn std::error::Error,
        "failed to initialize backend clients, aborting run"
    );
}

/// Selects the operations to run, checking them against the component's capability.
fn resolve_operations(
    name: &str,
    component: &Component,
    requested: &[Operation],
) -> Result<Vec<Operation>> {
    let capability = component.capability();
    if requested.is_empty() {
        return Ok(match component {
            Component::ObjectStorage(_) => ObjectOperation::ALL.map(Operation::Object).to_vec(),
            Component::Queue(_) => QueueOperation::ALL.map(Operation::Queue).to_vec(),
        });
    }

    for operation in requested {
        if operation.capability() != capability {
            return Err(Error::UnsupportedCapability {
                component: name.to_owned(),
                capability: operation.capability(),
            });
        }
    }
    Ok(requested.to_vec())
}
