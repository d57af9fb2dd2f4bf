//! Dispatch event slots, keyed by (envelope, event type).

use saga_types::{DispatchEvent, EnvelopeId, EventType};

use crate::StoreError;

pub trait EventReader {
    fn get_event(
        &self,
        envelope: &EnvelopeId,
        event_type: EventType,
    ) -> Result<Option<DispatchEvent>, StoreError>;

    /// Every slot for one envelope.
    fn events_for_envelope(&self, envelope: &EnvelopeId) -> Result<Vec<DispatchEvent>, StoreError>;

    fn iter_events(&self) -> Result<Vec<DispatchEvent>, StoreError>;
}

pub trait EventWriter {
    /// Upsert: replaces whatever the slot held.
    fn put_event(&mut self, event: &DispatchEvent) -> Result<(), StoreError>;
}
