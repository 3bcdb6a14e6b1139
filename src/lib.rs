//! Metering aggregator - partitioned event-sourcing aggregation engine
//!
//! Folds the usage events of a partitioned, append-only log into per-partition
//! billing state, stitching archived capture segments and the live log into
//! one ordered stream per partition, snapshotting the state and submitting
//! deduplicated usage batches to a billing API.

pub mod billing;
pub mod bus;
pub mod capture;
pub mod config;
pub mod fold;
pub mod metering;
pub mod model;
pub mod partitioning;
pub mod pipeline;
pub mod snapshot;
pub mod storage;
pub mod submission;
pub mod supervisor;
pub mod utils;
