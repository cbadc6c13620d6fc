//! The `benchmonik` command line tool.
//!
//! Loads scenario files, runs them through the [`Driver`](benchmonik_core::Driver) of
//! `benchmonik-core` and prints a summary per scenario. Each file is processed on its own: a file
//! that fails to load or run is logged and the remaining files still run.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod observability;
pub mod report;
pub mod run;
