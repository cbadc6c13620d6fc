//! Test utilities for benchmonik.
//!
//! This crate provides utilities to facilitate testing of the benchmark engine and its backends.
//! See the modules for all available utilities.

pub mod backends;
pub mod tracing;
