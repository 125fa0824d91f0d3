//! Cluster-wide aggregator for TCP connection events written by kernel
//! tracing tools.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod export;
pub mod presentation;
pub mod queue;
pub mod sink;
pub mod stats;
pub mod tailer;
pub mod tracer;
