//! Metrics serialization.

pub mod encoders;
