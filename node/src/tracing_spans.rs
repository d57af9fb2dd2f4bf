//! Pre-built [`tracing::Span`] constructors for common saga operations.
//!
//! Consistent span names and field sets make it easy to filter and
//! correlate one envelope's progress across handlers.

use tracing::{info_span, Span};

use saga_types::{EnvelopeId, EventType};

/// One dispatcher invocation of a handler.
pub fn dispatch_span(event_type: EventType, envelope: &EnvelopeId, event_id: &uuid::Uuid) -> Span {
    info_span!("dispatch", kind = %event_type, envelope = %envelope, event = %event_id)
}

/// The unit of work a reaper runs on its worker pool.
pub fn reaper_span(reaper: &'static str, envelope: &EnvelopeId) -> Span {
    info_span!("reaper", reaper, envelope = %envelope)
}

/// One batch handed to the checkpointer.
pub fn batch_span(first: u64, last: u64, blocks: usize) -> Span {
    info_span!("batch", first, last, blocks)
}

/// One sweeper pass.
pub fn sweep_span(sweeper: &'static str) -> Span {
    info_span!("sweep", sweeper)
}
