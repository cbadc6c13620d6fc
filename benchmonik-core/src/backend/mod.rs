//! Backend capabilities and the adapters that ship with the crate.
//!
//! Every backend client implements [`StorageClient`] plus one or more capabilities:
//! [`ObjectStorage`], [`PushQueueStorage`] and [`PullQueueStorage`]. Benchmarks only ever talk to
//! backends through these traits.

mod common;
pub mod in_memory;
pub mod local_fs;

pub use common::*;
