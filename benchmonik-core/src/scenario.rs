//! The scenario parameter space.
//!
//! A [`ParameterSpace`] is a list of named axes, each with candidate values. Its scenarios are
//! the literal cross product of all axes, enumerated lazily in a fixed order: the first declared
//! axis varies slowest and values are visited in their declared order. Axes that are not
//! declared keep the value of the base [`ScenarioParameters`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named dimension of the parameter space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Size of every uploaded object in bytes.
    PayloadSize,
    /// Size of the chunks an upload is split into.
    ChunkUploadSize,
    /// Size of the chunks a backend streams downloads in.
    ChunkDownloadSize,
    /// Internal parallelism of a backend client.
    DegreeOfParallelism,
    /// Number of concurrent runners, each with its own client.
    ConcurrentRunners,
    /// Number of objects each runner uploads or reads per iteration.
    ObjectsPerRunner,
    /// Maximum number of messages per push or pull call.
    MaxItemsPerOperation,
    /// Number of messages each runner moves per iteration.
    MessageCount,
}

impl Axis {
    /// The name of this axis as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PayloadSize => "payload_size",
            Self::ChunkUploadSize => "chunk_upload_size",
            Self::ChunkDownloadSize => "chunk_download_size",
            Self::DegreeOfParallelism => "degree_of_parallelism",
            Self::ConcurrentRunners => "concurrent_runners",
            Self::ObjectsPerRunner => "objects_per_runner",
            Self::MaxItemsPerOperation => "max_items_per_operation",
            Self::MessageCount => "message_count",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete point of the parameter space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioParameters {
    /// Size of every uploaded object in bytes.
    pub payload_size: u64,
    /// Size of the chunks an upload is split into.
    pub chunk_upload_size: u64,
    /// Size of the chunks a backend streams downloads in.
    pub chunk_download_size: u64,
    /// Internal parallelism of a backend client.
    pub degree_of_parallelism: u64,
    /// Number of concurrent runners.
    pub concurrent_runners: u64,
    /// Number of objects per runner.
    pub objects_per_runner: u64,
    /// Maximum number of messages per push or pull call.
    pub max_items_per_operation: u64,
    /// Number of messages per runner.
    pub message_count: u64,
}

impl Default for ScenarioParameters {
    fn default() -> Self {
        Self {
            payload_size: 1024 * 1024,
            chunk_upload_size: 1024 * 1024,
            chunk_download_size: 64 * 1024,
            degree_of_parallelism: 1,
            concurrent_runners: 1,
            objects_per_runner: 1,
            max_items_per_operation: 10,
            message_count: 100,
        }
    }
}

impl ScenarioParameters {
    /// Returns the value of the given axis.
    pub fn get(&self, axis: Axis) -> u64 {
        match axis {
            Axis::PayloadSize => self.payload_size,
            Axis::ChunkUploadSize => self.chunk_upload_size,
            Axis::ChunkDownloadSize => self.chunk_download_size,
            Axis::DegreeOfParallelism => self.degree_of_parallelism,
            Axis::ConcurrentRunners => self.concurrent_runners,
            Axis::ObjectsPerRunner => self.objects_per_runner,
            Axis::MaxItemsPerOperation => self.max_items_per_operation,
            Axis::MessageCount => self.message_count,
        }
    }

    /// Sets the value of the given axis.
    pub fn set(&mut self, axis: Axis, value: u64) {
        let field = match axis {
            Axis::PayloadSize => &mut self.payload_size,
            Axis::ChunkUploadSize => &mut self.chunk_upload_size,
            Axis::ChunkDownloadSize => &mut self.chunk_download_size,
            Axis::DegreeOfParallelism => &mut self.degree_of_parallelism,
            Axis::ConcurrentRunners => &mut self.concurrent_runners,
            Axis::ObjectsPerRunner => &mut self.objects_per_runner,
            Axis::MaxItemsPerOperation => &mut self.max_items_per_operation,
            Axis::MessageCount => &mut self.message_count,
        };
        *field = value;
    }

    /// Number of concurrent runners as an index bound.
    pub fn runners(&self) -> usize {
        self.concurrent_runners as usize
    }

    /// Checks that every field is positive.
    pub fn validate(&self) -> Result<()> {
        for axis in ALL_AXES {
            if self.get(axis) == 0 {
                return Err(Error::Configuration(format!("{axis} must be positive")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ScenarioParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for axis in ALL_AXES {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{axis}={}", self.get(axis))?;
        }
        Ok(())
    }
}

const ALL_AXES: [Axis; 8] = [
    Axis::PayloadSize,
    Axis::ChunkUploadSize,
    Axis::ChunkDownloadSize,
    Axis::DegreeOfParallelism,
    Axis::ConcurrentRunners,
    Axis::ObjectsPerRunner,
    Axis::MaxItemsPerOperation,
    Axis::MessageCount,
];

/// A cross product of parameter axes.
#[derive(Clone, Debug)]
pub struct ParameterSpace {
    base: ScenarioParameters,
    axes: Vec<(Axis, Vec<u64>)>,
}

impl ParameterSpace {
    /// Creates a space with no axes, containing only `base`.
    pub fn new(base: ScenarioParameters) -> Self {
        Self {
            base,
            axes: Vec::new(),
        }
    }

    /// Declares an axis with its candidate values.
    ///
    /// Fails if the axis was already declared, has no values or contains a zero.
    pub fn axis(mut self, axis: Axis, values: impl IntoIterator<Item = u64>) -> Result<Self> {
        if self.axes.iter().any(|(existing, _)| *existing == axis) {
            return Err(Error::Configuration(format!("axis {axis} declared twice")));
        }
        let values: Vec<u64> = values.into_iter().collect();
        if values.is_empty() {
            return Err(Error::Configuration(format!("axis {axis} has no values")));
        }
        if values.contains(&0) {
            return Err(Error::Configuration(format!("{axis} must be positive")));
        }
        self.axes.push((axis, values));
        Ok(self)
    }

    /// The declared axes in declaration order.
    pub fn axes(&self) -> impl Iterator<Item = Axis> + '_ {
        self.axes.iter().map(|(axis, _)| *axis)
    }

    /// The number of scenarios in this space.
    pub fn len(&self) -> usize {
        self.axes.iter().map(|(_, values)| values.len()).product()
    }

    /// Always `false`, since every axis has at least one value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enumerates all scenarios. Every call starts over from the first scenario.
    pub fn iter(&self) -> Scenarios<'_> {
        Scenarios {
            space: self,
            cursor: Some(vec![0; self.axes.len()]),
        }
    }

    /// Validates the base parameters.
    pub fn validate(&self) -> Result<()> {
        self.base.validate()
    }
}

impl<'a> IntoIterator for &'a ParameterSpace {
    type Item = ScenarioParameters;
    type IntoIter = Scenarios<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over the scenarios of a [`ParameterSpace`].
#[derive(Debug)]
pub struct Scenarios<'a> {
    space: &'a ParameterSpace,
    cursor: Option<Vec<usize>>,
}

impl Iterator for Scenarios<'_> {
    type Item = ScenarioParameters;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.as_mut()?;

        let mut params = self.space.base.clone();
        for ((axis, values), &index) in self.space.axes.iter().zip(cursor.iter()) {
            params.set(*axis, values[index]);
        }

        // Advance like an odometer, the last declared axis turning fastest.
        let mut exhausted = true;
        for (position, (_, values)) in self.space.axes.iter().enumerate().rev() {
            cursor[position] += 1;
            if cursor[position] < values.len() {
                exhausted = false;
                break;
            }
            cursor[position] = 0;
        }
        if exhausted {
            self.cursor = None;
        }

        Some(params)
    }
}
