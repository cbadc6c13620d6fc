//! Concurrent benchmark orchestration for storage and messaging backends.
//!
//! The crate drives interchangeable backends through a parameterized matrix of scenarios. Every
//! scenario instance acquires one initialized client per runner ([`pool`]), and every iteration
//! walks through setup, a timed measured phase and cleanup ([`lifecycle`]). Measured phases fan
//! out across runners ([`coordinator`]), move data in chunks ([`stream`]) and bounded batches
//! ([`batch`]), and leave the backend empty for the next iteration.
//!
//! Backends are only reached through the capability traits in [`backend`] and are looked up by
//! name in a [`Registry`](registry::Registry). The [`Driver`](driver::Driver) sequences it all.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod batch;
pub mod benchmarks;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod payload;
pub mod pool;
pub mod profiling;
pub mod registry;
pub mod scenario;
pub mod stream;

pub use driver::{BenchmarkPlan, Driver, DriverSettings, ResultSink, RunSummary, ScenarioInfo};
pub use error::{Error, Result};
pub use registry::Registry;
