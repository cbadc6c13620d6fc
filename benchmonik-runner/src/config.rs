//! Scenario files.
//!
//! Every scenario file describes one benchmark plan. It is loaded with the following precedence
//! (highest to lowest):
//!
//! 1. Environment variables (prefixed with `BENCHMONIK__`)
//! 2. The file itself, JSON for `.json` and YAML for `.yaml` or `.yml`
//! 3. Defaults
//!
//! Environment variables use double underscores (`__`) to denote nested structures, for example
//! `BENCHMONIK__SETTINGS__ITERATIONS=3` or `BENCHMONIK__OVERRIDES__SSL=false`.
//!
//! # Example
//!
//! ```yaml
//! component: localstorage
//! operations: [AddObject, GetObject]
//! shape: throughput
//!
//! parameters:
//!   - axis: payload_size
//!     values: [1KiB, 1MiB]
//!   - axis: concurrent_runners
//!     values: [1, 8]
//!
//! settings:
//!   iterations: 5
//!   timeout: 30s
//!
//! overrides:
//!   root: /tmp/benchmonik
//! ```
//!
//! Without `parameters`, the default sweep of the component's capability is used.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use benchmonik_core::benchmarks::queue::QueueSettings;
use benchmonik_core::benchmarks::{Operation, Shape};
use benchmonik_core::pool::Capability;
use benchmonik_core::scenario::{Axis, ParameterSpace, ScenarioParameters};
use benchmonik_core::{BenchmarkPlan, DriverSettings, Registry};
use bytesize::ByteSize;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Yaml};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for all scenario options.
const ENV_PREFIX: &str = "BENCHMONIK__";

/// A value of a parameter axis: a plain count or a human-readable size such as `"5MiB"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// A plain number.
    Count(u64),
    /// A size in bytes.
    Size(ByteSize),
}

impl ParameterValue {
    /// The numeric value.
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Count(count) => count,
            Self::Size(size) => size.as_u64(),
        }
    }
}

/// The candidate values of one axis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisValues {
    /// The axis.
    pub axis: Axis,
    /// Its values, in the order they are run.
    pub values: Vec<ParameterValue>,
}

/// A backend override. Scalars of any type are accepted and forwarded as strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OverrideValue {
    /// A boolean flag.
    Bool(bool),
    /// An integer.
    Integer(i64),
    /// A floating point number.
    Float(f64),
    /// Anything else.
    Text(String),
}

impl fmt::Display for OverrideValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => value.fmt(f),
            Self::Integer(value) => value.fmt(f),
            Self::Float(value) => value.fmt(f),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Run settings that do not vary across scenarios.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Iterations per operation that are run but not aggregated.
    pub warmup_iterations: usize,
    /// Measured iterations per operation.
    pub iterations: usize,
    /// Time budget of every measured phase.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Base name of queue partitions.
    pub partition: String,
    /// Whether all queue runners share one partition.
    pub shared_partition: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let queue = QueueSettings::default();
        Self {
            warmup_iterations: 1,
            iterations: 12,
            timeout: None,
            partition: queue.partition,
            shared_partition: queue.shared_partition,
        }
    }
}

/// One scenario file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry key of the backend, case-insensitive.
    pub component: String,
    /// Operations to run. Empty runs every operation of the component.
    pub operations: Vec<String>,
    /// Shape of object storage benchmarks.
    pub shape: Shape,
    /// The parameter axes. Empty uses the default sweep of the component.
    pub parameters: Vec<AxisValues>,
    /// Run settings.
    pub settings: Settings,
    /// Backend-specific values, forwarded to the backend factory.
    pub overrides: BTreeMap<String, OverrideValue>,
}

impl Config {
    /// Loads a scenario file.
    ///
    /// The format is chosen by extension. Environment variables override values from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, has an unknown extension, or does
    /// not name a component.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("scenario file `{}` does not exist", path.display());
        }
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => figment.merge(Json::file_exact(path)),
            Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
            _ => bail!("unsupported scenario file `{}`", path.display()),
        };
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to load scenario file `{}`", path.display()))?;

        if config.component.trim().is_empty() {
            bail!("scenario file `{}` does not name a component", path.display());
        }
        Ok(config)
    }

    /// Builds the benchmark plan, resolving defaults against the registered component.
    pub fn plan(&self, registry: &Registry) -> Result<BenchmarkPlan> {
        let capability = registry.get(&self.component)?.capability();

        let operations = self
            .operations
            .iter()
            .map(|name| name.parse::<Operation>())
            .collect::<Result<Vec<_>, _>>()?;

        let defaults;
        let axes = if self.parameters.is_empty() {
            defaults = default_axes(capability);
            &defaults
        } else {
            &self.parameters
        };

        let mut space = ParameterSpace::new(ScenarioParameters::default());
        for AxisValues { axis, values } in axes {
            space = space.axis(*axis, values.iter().map(|v| v.as_u64()))?;
        }

        Ok(BenchmarkPlan {
            component: self.component.clone(),
            operations,
            shape: self.shape,
            space,
            overrides: self
                .overrides
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect(),
        })
    }

    /// The driver settings of this file. Process-wide options are left at their defaults.
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            warmup_iterations: self.settings.warmup_iterations,
            iterations: self.settings.iterations,
            measured_timeout: self.settings.timeout,
            queue: QueueSettings {
                partition: self.settings.partition.clone(),
                shared_partition: self.settings.shared_partition,
            },
            ..Default::default()
        }
    }
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

const OBJECT_AXES: &[(Axis, &[u64])] = &[
    (Axis::PayloadSize, &[KIB, MIB, 20 * MIB]),
    (Axis::ConcurrentRunners, &[5, 10]),
    (Axis::ObjectsPerRunner, &[20]),
    (Axis::ChunkUploadSize, &[5 * MIB]),
    (Axis::ChunkDownloadSize, &[MIB]),
    (Axis::DegreeOfParallelism, &[4]),
];

const QUEUE_AXES: &[(Axis, &[u64])] = &[
    (Axis::MaxItemsPerOperation, &[1, 10]),
    (Axis::MessageCount, &[100]),
    (Axis::ConcurrentRunners, &[1, 5, 25, 50, 75, 100]),
];

/// The default sweep of each capability.
pub fn default_axes(capability: Capability) -> Vec<AxisValues> {
    let axes = match capability {
        Capability::ObjectStorage => OBJECT_AXES,
        Capability::PushQueue | Capability::PullQueue => QUEUE_AXES,
    };

    axes.iter()
        .map(|&(axis, values)| AxisValues {
            axis,
            values: values.iter().copied().map(ParameterValue::Count).collect(),
        })
        .collect()
}
