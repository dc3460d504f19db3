//! plow: a single-target HTTP(S) load generator.
//!
//! Drives a configured level of concurrent request load against one URL,
//! measures per-request latency and throughput in real time, and produces
//! live terminal and chart-based reports.

pub mod aggregator;
pub mod charts;
pub mod client;
pub mod config;
pub mod histogram;
pub mod printer;
pub mod quantile;
pub mod record;
pub mod stats;
pub mod transport;
pub mod worker;
