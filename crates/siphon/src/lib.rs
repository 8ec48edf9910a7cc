//! siphon: continuous mirroring of compressed log objects from an
//! object-store bucket to HTTP log-ingestion endpoints.
//!
//! The daemon is a pull-based streaming pipeline. A scanner walks the
//! bucket's date partitions inside a bounded catch-up window and turns new
//! objects into file jobs; download workers fetch, gunzip, and split them
//! into log lines under a format descriptor; an aggregator batches lines
//! by count, bytes, and time; HTTP senders fan batches out round-robin
//! over the configured endpoints. A durable watermark (local file or
//! Redis) records the last acknowledged object so a restart resumes with
//! at-least-once semantics and a bounded duplicate window.
//!
//! See the [`pipeline`] module for the queueing/backpressure model and
//! [`supervisor`] for lifecycle ordering.

pub mod config;
pub mod formats;
pub mod logging;
pub mod pipeline;
pub mod scanner;
pub mod state;
pub mod supervisor;
pub mod telemetry;
