//! The ingestion pipeline: download workers feeding HTTP senders.
//!
//! ```text
//!   Scanner
//!      │ file jobs (bounded, try_send + defer)
//!      v
//!   ┌──────────────────┐
//!   │  Download pool   │  N workers: fetch → gunzip → split → filter
//!   └────────┬─────────┘
//!            │ line buffer (bounded, blocking send — the backpressure surface)
//!            v
//!   ┌──────────────────┐
//!   │    Aggregator    │  batch by count / bytes / time
//!   └────────┬─────────┘
//!            │ batch queue (bounded, 2·M)
//!            v
//!   ┌──────────────────┐
//!   │  HTTP senders    │  M workers, static round-robin over endpoints
//!   └──────────────────┘
//! ```
//!
//! Every queue is a bounded `async_channel`; closure travels with
//! ownership. The download pool holds the only line-buffer senders, so the
//! buffer closes exactly when the last worker returns; the aggregator
//! holds the only batch sender, so the batch queue closes when it drains
//! and exits. Senders then finish whatever is left and stop. A stalled
//! sink therefore slows downloads instead of dropping lines.

pub mod download;
pub mod sender;

/// An owned log line moving through the pipeline, without its trailing
/// newline.
pub type LogLine = bytes::Bytes;
