//! Console summary of benchmark results.

use std::fmt;
use std::time::Duration;

use benchmonik_core::benchmarks::Operation;
use benchmonik_core::lifecycle::{IterationResult, Outcome, Transferred};
use benchmonik_core::{ResultSink, ScenarioInfo};
use bytesize::ByteSize;
use indicatif::{ProgressBar, ProgressStyle};
use sketches_ddsketch::DDSketch;
use yansi::Paint;

/// Aggregated measurements of one operation within one scenario.
#[derive(Default)]
pub struct OperationMetrics {
    /// Latency of successful measured phases, in seconds.
    pub timing: DDSketch,
    /// Total time spent in successful measured phases.
    pub elapsed: Duration,
    /// Data moved by successful measured phases.
    pub moved: Transferred,
    /// Failed iterations, correctness failures included.
    pub failures: usize,
    /// Iterations that failed on a size mismatch.
    pub correctness_failures: usize,
    /// Iterations cut short by cancellation.
    pub cancelled: usize,
    /// Largest resident memory growth across a measured phase, in bytes.
    pub max_memory_growth: Option<i64>,
}

impl fmt::Debug for OperationMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationMetrics")
            .field("timing", &self.timing.count())
            .field("elapsed", &self.elapsed)
            .field("moved", &self.moved)
            .field("failures", &self.failures)
            .field("correctness_failures", &self.correctness_failures)
            .field("cancelled", &self.cancelled)
            .field("max_memory_growth", &self.max_memory_growth)
            .finish()
    }
}

impl OperationMetrics {
    fn add(&mut self, result: &IterationResult) {
        match &result.outcome {
            Outcome::Completed => {
                self.timing.add(result.elapsed.as_secs_f64());
                self.elapsed += result.elapsed;
                self.moved += result.moved;
            }
            Outcome::Failed { .. } => {
                self.failures += 1;
                if result.is_correctness_failure() {
                    self.correctness_failures += 1;
                }
            }
            Outcome::Cancelled => self.cancelled += 1,
        }

        if let Some(memory) = result.memory {
            let growth = memory.growth();
            self.max_memory_growth = Some(self.max_memory_growth.map_or(growth, |g| g.max(growth)));
        }
    }

    /// Number of successful measured iterations.
    pub fn ops(&self) -> usize {
        self.timing.count()
    }
}

/// A [`ResultSink`] that prints a summary per scenario to stdout.
///
/// Warmup iterations are logged but not aggregated.
pub struct ConsoleReport {
    progress: bool,
    bar: Option<ProgressBar>,
    current: Vec<(Operation, OperationMetrics)>,
    finished: Vec<(usize, Operation, OperationMetrics)>,
}

impl ConsoleReport {
    /// Creates a report. With `progress`, a spinner is shown while a scenario runs.
    pub fn new(progress: bool) -> Self {
        Self {
            progress,
            bar: None,
            current: Vec::new(),
            finished: Vec::new(),
        }
    }

    /// Metrics of every finished scenario and operation, in the order they ran.
    pub fn finished(&self) -> &[(usize, Operation, OperationMetrics)] {
        &self.finished
    }

    fn metrics(&mut self, operation: Operation) -> &mut OperationMetrics {
        let index = match self.current.iter().position(|(op, _)| *op == operation) {
            Some(index) => index,
            None => {
                self.current.push((operation, OperationMetrics::default()));
                self.current.len() - 1
            }
        };
        &mut self.current[index].1
    }
}

impl fmt::Debug for ConsoleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleReport")
            .field("progress", &self.progress)
            .field("current", &self.current.len())
            .field("finished", &self.finished.len())
            .finish()
    }
}

impl ResultSink for ConsoleReport {
    fn scenario_started(&mut self, scenario: &ScenarioInfo) {
        println!();
        println!(
            "{} {}/{} ({})",
            "## Scenario".bold(),
            (scenario.index + 1).bold(),
            scenario.total,
            scenario.component.as_str().bold().blue(),
        );
        println!("  {}", scenario.parameters.dim());

        if self.progress {
            let bar = ProgressBar::new_spinner().with_message("Running scenario:");
            if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} {elapsed}") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
            self.bar = Some(bar);
        }
    }

    fn record(&mut self, _scenario: &ScenarioInfo, operation: Operation, result: IterationResult) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("Running {operation}:"));
        }
        if result.warmup {
            tracing::debug!(
                %operation,
                iteration = result.iteration,
                elapsed = ?result.elapsed,
                success = result.is_success(),
                "warmup iteration finished"
            );
            return;
        }
        self.metrics(operation).add(&result);
    }

    fn scenario_finished(&mut self, scenario: &ScenarioInfo) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        for (operation, metrics) in self.current.drain(..) {
            print_metrics(operation, &metrics);
            self.finished.push((scenario.index, operation, metrics));
        }
    }
}

fn print_metrics(operation: Operation, metrics: &OperationMetrics) {
    print!(
        "{} ({} ops",
        format!("{operation}:").bold().green(),
        metrics.ops().bold()
    );
    if metrics.failures > 0 {
        print!(
            ", {}",
            format!("{} FAILURES", metrics.failures).bold().red()
        );
    }
    if metrics.correctness_failures > 0 {
        print!(
            ", {}",
            format!("{} SIZE MISMATCHES", metrics.correctness_failures)
                .bold()
                .red()
        );
    }
    if metrics.cancelled > 0 {
        print!(", {} cancelled", metrics.cancelled.yellow());
    }
    println!(")");

    if metrics.ops() == 0 {
        return;
    }
    print_ops(&metrics.timing, metrics.elapsed);
    print_throughput(metrics.moved, metrics.elapsed);
    print_percentiles(&metrics.timing);
    if let Some(growth) = metrics.max_memory_growth {
        let sign = if growth < 0 { "-" } else { "+" };
        println!(
            "  memory: {sign}{:.2}",
            ByteSize::b(growth.unsigned_abs()).bold()
        );
    }
}

fn print_ops(sketch: &DDSketch, elapsed: Duration) {
    let ops_ps = sketch.count() as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    print!("  {:.2} operations/s", ops_ps.bold());
}

fn print_throughput(moved: Transferred, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    if moved.bytes > 0 {
        let throughput = (moved.bytes as f64 / secs) as u64;
        print!(", {:.2}/s", ByteSize::b(throughput).bold());
    }
    if moved.messages > 0 {
        print!(", {:.2} messages/s", (moved.messages as f64 / secs).bold());
    }
    println!();
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let secs = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(secs.max(0.0))
}

fn print_percentiles(sketch: &DDSketch) {
    let avg = Duration::from_secs_f64(sketch.sum().unwrap_or_default() / sketch.count() as f64);
    let p50 = quantile(sketch, 0.5);
    let p90 = quantile(sketch, 0.9);
    let p99 = quantile(sketch, 0.99);
    println!(
        "  avg: {:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}",
        avg.bold()
    );
}

#[cfg(test)]
mod tests {
    use benchmonik_core::Error;
    use benchmonik_core::benchmarks::{ObjectOperation, QueueOperation};
    use benchmonik_core::lifecycle::Phase;
    use benchmonik_core::profiling::MemoryDelta;
    use benchmonik_core::scenario::ScenarioParameters;

    use super::*;

    fn scenario(index: usize) -> ScenarioInfo {
        ScenarioInfo {
            component: "memory".into(),
            index,
            total: 2,
            parameters: ScenarioParameters::default(),
        }
    }

    fn result(iteration: usize, warmup: bool, outcome: Outcome) -> IterationResult {
        IterationResult {
            iteration,
            warmup,
            elapsed: Duration::from_millis(10 * (iteration as u64 + 1)),
            moved: Transferred::bytes(1000),
            memory: None,
            outcome,
        }
    }

    #[test]
    fn warmups_are_not_aggregated() {
        let mut report = ConsoleReport::new(false);
        let operation = Operation::Object(ObjectOperation::AddObject);
        let info = scenario(0);

        report.scenario_started(&info);
        report.record(&info, operation, result(0, true, Outcome::Completed));
        report.record(&info, operation, result(1, false, Outcome::Completed));
        report.record(&info, operation, result(2, false, Outcome::Completed));
        report.scenario_finished(&info);

        let [(index, recorded, metrics)] = report.finished() else {
            panic!("expected one operation");
        };
        assert_eq!(*index, 0);
        assert_eq!(*recorded, operation);
        assert_eq!(metrics.ops(), 2);
        assert_eq!(metrics.moved.bytes, 2000);
        assert_eq!(metrics.elapsed, Duration::from_millis(50));
    }

    #[test]
    fn failures_are_counted_per_kind() {
        let mut report = ConsoleReport::new(false);
        let operation = Operation::Object(ObjectOperation::GetObject);
        let info = scenario(1);

        let mismatch = Outcome::Failed {
            phase: Phase::Measured,
            error: Error::SizeMismatch {
                expected: 10,
                actual: 9,
            },
        };
        let failed = Outcome::Failed {
            phase: Phase::Setup,
            error: Error::Configuration("broken".into()),
        };

        report.scenario_started(&info);
        report.record(&info, operation, result(0, false, mismatch));
        report.record(&info, operation, result(1, false, failed));
        report.record(&info, operation, result(2, false, Outcome::Cancelled));
        report.scenario_finished(&info);

        let (_, _, metrics) = &report.finished()[0];
        assert_eq!(metrics.ops(), 0);
        assert_eq!(metrics.failures, 2);
        assert_eq!(metrics.correctness_failures, 1);
        assert_eq!(metrics.cancelled, 1);
    }

    #[test]
    fn operations_keep_their_order() {
        let mut report = ConsoleReport::new(false);
        let push = Operation::Queue(QueueOperation::PushMessages);
        let pull = Operation::Queue(QueueOperation::PullMessagesAck);
        let info = scenario(0);

        report.scenario_started(&info);
        for operation in [push, pull] {
            let mut result = result(0, false, Outcome::Completed);
            result.moved = Transferred::messages(100);
            result.memory = Some(MemoryDelta::from((4096, 1024)));
            report.record(&info, operation, result);
        }
        report.scenario_finished(&info);

        let operations: Vec<_> = report.finished().iter().map(|(_, op, _)| *op).collect();
        assert_eq!(operations, [push, pull]);
        let (_, _, metrics) = &report.finished()[1];
        assert_eq!(metrics.moved.messages, 100);
        assert_eq!(metrics.max_memory_growth, Some(-3072));
    }
}
