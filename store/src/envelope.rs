//! Envelope rows and their secondary indexes.

use saga_types::{Envelope, EnvelopeId, ExecutionId, GroupId, ScopeId};

use crate::StoreError;

pub trait EnvelopeReader {
    fn get_envelope(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError>;

    /// Every local copy of one logical execution.
    fn envelopes_by_execution(&self, execution: &ExecutionId)
        -> Result<Vec<Envelope>, StoreError>;

    fn envelopes_by_group(&self, group: &GroupId) -> Result<Vec<Envelope>, StoreError>;

    fn envelopes_by_scope(&self, scope: &ScopeId) -> Result<Vec<Envelope>, StoreError>;

    fn envelope_count(&self) -> Result<u64, StoreError>;

    fn require_envelope(&self, id: &EnvelopeId) -> Result<Envelope, StoreError> {
        self.get_envelope(id)?
            .ok_or_else(|| StoreError::NotFound(format!("envelope {id}")))
    }
}

pub trait EnvelopeWriter {
    /// Write the row and maintain the execution, group and scope indexes.
    /// Callers go through [`EnvelopeWriter::put_envelope`].
    fn write_envelope_row(&mut self, envelope: &Envelope) -> Result<(), StoreError>;

    /// Persist an envelope, refusing rows whose columns diverge from their
    /// document.
    fn put_envelope(&mut self, envelope: &Envelope) -> Result<(), StoreError> {
        envelope.verify_mirror()?;
        self.write_envelope_row(envelope)
    }
}
