#![warn(missing_docs)]

//! Client interfaces to the time-series storage engine and the series
//! directory, plus in-memory reference engines.
//!
//! The storage engine itself is outside the replication core; the
//! datalog layer only ever talks to these traits. The in-memory
//! implementations exist for replay/apply tests and small deployments.

pub mod client;
pub mod error;
pub mod memory;

pub use client::{DirectoryClient, StoreClient, WriteToken};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryDirectory, MemoryStore};
