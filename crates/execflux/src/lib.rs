//! Run a command, sample its resource usage and report the run to InfluxDB.
//!
//! The pipeline is split in small pieces that the [`orchestrator`] wires
//! together:
//!
//! - [`runner`] spawns the command, forwards its output and applies the deadline
//! - [`sampler`] polls the child's CPU and memory usage while it runs
//! - [`point`] and [`metrics::encoders`] model and serialize measurements
//! - [`publisher`] writes them to InfluxDB in batches, with retry

pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod point;
pub mod publisher;
pub mod runner;
pub mod sampler;
