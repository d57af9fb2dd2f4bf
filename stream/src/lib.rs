//! Tails a chain node for new blocks, backfills history from a checkpoint,
//! filters events against a watch list and hands ordered batches to a sink.
//!
//! The consumer never retries on its own: when the subscription fails or
//! goes stale, [`EventStreamConsumer::run`] returns an error and the owner
//! decides when to start again from its persisted checkpoint.

mod backfill;
pub mod consumer;
pub mod error;
pub mod filter;
mod watchdog;

pub use consumer::{BatchSink, ConsumerConfig, EventStreamConsumer, SinkError, StreamState};
pub use error::StreamError;
pub use filter::{filter_block, should_stream};
