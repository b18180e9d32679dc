#![warn(missing_docs)]

//! Strata datalog: the mutation-replication subsystem of the store.
//!
//! Every local write (datapoint insert, series registration or
//! unregistration, deletion) is recorded exactly once, in arrival
//! order, to a rotating append-only log of segment files. Feeders
//! stream log records to remote consumer instances, which apply them
//! through a partitioned worker pool preserving per-series order and
//! re-append them to their own log so further peers can chain on.
//! Records whose origin id equals the local instance id are dropped on
//! receipt, which is what keeps arbitrary fan-out/chain topologies
//! loop-free.

pub mod config;
pub mod consumer;
pub mod error;
pub mod feeder;
pub mod log;
pub mod manager;
pub mod offsets;
pub mod protocol;
pub mod segment;
pub mod workers;

pub use config::DatalogConfig;
pub use consumer::{Consumer, ConsumerConfig};
pub use error::{DatalogError, DatalogResult};
pub use feeder::{Feeder, FeederConfig};
pub use log::SegmentStore;
pub use manager::{Datalog, DatalogManager};
pub use offsets::{LogOffset, OffsetStore};
pub use protocol::{Frame, ShardFilter};
pub use workers::{ApplyJob, ApplyPool};
