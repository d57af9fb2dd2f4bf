//! Envelope lifecycle transitions.
//!
//! Every `on_handle_<phase>` function is idempotent under redelivery:
//!
//! - a record with `error_at` set is redirected to the error transition;
//! - a record already at (or beyond) the phase is left unchanged;
//! - otherwise the status moves to the phase, the phase is stamped with
//!   `now`, and row and document are rebuilt together by [`commit_state`].
//!
//! A replay at the handler's own phase returns [`Step::Unchanged`] instead of
//! redirecting into the next phase's handler. The next phase is only reached
//! once its side effect (peer delivery, chain submission) has happened and
//! its own handler runs. The trade-off: a replay never finishes a stalled
//! next phase. That is left to the next phase's own trigger and the dispatch
//! sweeper, and a replayed SIGNED never submits again.
//!
//! Transitions mutate the record only on success.

use thiserror::Error;

use saga_types::{
    Envelope, EnvelopeDocument, EnvelopeId, EnvelopeStatus, Fact, PartyKey, Scope, SubEnvelope,
    Timestamp, TxHash,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("envelope {envelope}: status {status} is never committed by a transition")]
    Uncommittable {
        envelope: EnvelopeId,
        status: EnvelopeStatus,
    },

    #[error("envelope {0} has no result to index")]
    MissingResult(EnvelopeId),
}

/// Data a phase commits alongside its stamp.
#[derive(Debug)]
pub enum CommitExtra<'a> {
    None,
    /// The executed result, adopted as the document's result side.
    Result(SubEnvelope),
    /// The chain-confirmed scope whose facts are merged on INDEX.
    Scope(&'a Scope),
    /// The chain transaction carrying the result.
    ChainTx(TxHash),
}

/// What a transition did to the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Advanced(EnvelopeStatus),
    /// The document changed without a status move.
    Updated,
    Unchanged,
}

impl Step {
    /// Whether the record must be written back.
    pub fn changed(&self) -> bool {
        !matches!(self, Step::Unchanged)
    }
}

/// Stamp `record.status` and rebuild the document and the mirrored columns.
pub fn commit_state(
    record: &mut Envelope,
    now: Timestamp,
    extra: CommitExtra<'_>,
) -> Result<(), StateMachineError> {
    let phase = record.status;
    if matches!(phase, EnvelopeStatus::Created | EnvelopeStatus::Inbox) {
        return Err(StateMachineError::Uncommittable {
            envelope: record.id,
            status: phase,
        });
    }

    let mut doc = record.document.clone();
    let mut chain_facts: Option<&[Fact]> = None;
    match extra {
        CommitExtra::None => {}
        CommitExtra::Result(result) => doc.result = Some(result),
        CommitExtra::Scope(scope) => chain_facts = Some(scope.facts_for(&record.group_id)),
        CommitExtra::ChainTx(tx) => doc.chain_tx = Some(tx),
    }

    match phase {
        EnvelopeStatus::Index => {
            let result = doc
                .result
                .as_mut()
                .ok_or(StateMachineError::MissingResult(record.id))?;
            if let Some(facts) = chain_facts {
                result.merge_outputs(facts);
            }
            doc.error_at = None;
        }
        EnvelopeStatus::Error => {
            doc.error_at.get_or_insert(now);
        }
        _ => {}
    }

    doc.stamps.set(phase, now);
    doc.current_mut().status = phase;
    record.document = doc;
    sync_columns(record, now);
    Ok(())
}

fn sync_columns(record: &mut Envelope, now: Timestamp) {
    let doc = &record.document;
    record.status = doc.status();
    record.stamps = doc.stamps.clone();
    record.error_at = doc.error_at;
    record.read_at = doc.read_at;
    record.chain_tx = doc.chain_tx;
    record.updated_at = now;
}

fn transition(
    record: &mut Envelope,
    phase: EnvelopeStatus,
    now: Timestamp,
    extra: CommitExtra<'_>,
) -> Result<Step, StateMachineError> {
    if record.error_at.is_some() {
        return on_handle_error(record, now);
    }
    if record.status.is_past(phase) || record.is_at(phase) {
        return Ok(Step::Unchanged);
    }
    let mut next = record.clone();
    next.status = phase;
    commit_state(&mut next, now, extra)?;
    *record = next;
    Ok(Step::Advanced(phase))
}

/// A freshly proposed envelope owned by the invoker.
pub fn on_handle_create(
    id: EnvelopeId,
    owner: PartyKey,
    input: SubEnvelope,
    now: Timestamp,
) -> Envelope {
    let mut input = input;
    input.status = EnvelopeStatus::Created;
    Envelope::from_document(id, owner, EnvelopeDocument::new(input, true), now)
}

/// A counter-party's copy of an envelope delivered by a peer.
pub fn on_handle_receive(
    id: EnvelopeId,
    owner: PartyKey,
    input: SubEnvelope,
    now: Timestamp,
) -> Envelope {
    let mut input = input;
    input.status = EnvelopeStatus::Inbox;
    let mut doc = EnvelopeDocument::new(input, false);
    doc.stamps.set(EnvelopeStatus::Inbox, now);
    Envelope::from_document(id, owner, doc, now)
}

pub fn on_handle_fragment(record: &mut Envelope, now: Timestamp) -> Result<Step, StateMachineError> {
    transition(record, EnvelopeStatus::Fragment, now, CommitExtra::None)
}

pub fn on_handle_execute(
    record: &mut Envelope,
    result: SubEnvelope,
    now: Timestamp,
) -> Result<Step, StateMachineError> {
    transition(record, EnvelopeStatus::Executed, now, CommitExtra::Result(result))
}

pub fn on_handle_outbox(record: &mut Envelope, now: Timestamp) -> Result<Step, StateMachineError> {
    transition(record, EnvelopeStatus::Outbox, now, CommitExtra::None)
}

/// Merge `peer`'s counter-signatures into the result.
///
/// An invoker without a result adopts the peer's. The envelope reaches
/// SIGNED once every recital party has signed; until then the merged
/// signatures are kept without a status move.
pub fn on_handle_sign(
    record: &mut Envelope,
    peer: &SubEnvelope,
    now: Timestamp,
) -> Result<Step, StateMachineError> {
    if record.error_at.is_some() {
        return on_handle_error(record, now);
    }
    let phase = EnvelopeStatus::Signed;
    if record.status.is_past(phase) || record.is_at(phase) {
        return Ok(Step::Unchanged);
    }

    let mut next = record.clone();
    let current_status = next.document.status();
    let merged = match next.document.result.as_mut() {
        Some(result) => result.merge_signatures(peer) > 0,
        None => {
            let mut adopted = peer.clone();
            adopted.status = current_status;
            next.document.result = Some(adopted);
            true
        }
    };

    if next.document.current().is_fully_signed() {
        next.status = phase;
        commit_state(&mut next, now, CommitExtra::None)?;
        *record = next;
        return Ok(Step::Advanced(phase));
    }
    if merged {
        next.updated_at = now;
        *record = next;
        return Ok(Step::Updated);
    }
    Ok(Step::Unchanged)
}

pub fn on_handle_chaincode(
    record: &mut Envelope,
    tx: TxHash,
    now: Timestamp,
) -> Result<Step, StateMachineError> {
    transition(record, EnvelopeStatus::Chaincode, now, CommitExtra::ChainTx(tx))
}

pub fn on_handle_index(
    record: &mut Envelope,
    scope: &Scope,
    now: Timestamp,
) -> Result<Step, StateMachineError> {
    transition(record, EnvelopeStatus::Index, now, CommitExtra::Scope(scope))
}

pub fn on_handle_complete(record: &mut Envelope, now: Timestamp) -> Result<Step, StateMachineError> {
    transition(record, EnvelopeStatus::Complete, now, CommitExtra::None)
}

/// Move to ERROR after an error was attached. ERROR absorbs; COMPLETE stays.
pub fn on_handle_error(record: &mut Envelope, now: Timestamp) -> Result<Step, StateMachineError> {
    if record.status.is_terminal() {
        return Ok(Step::Unchanged);
    }
    let mut next = record.clone();
    next.status = EnvelopeStatus::Error;
    commit_state(&mut next, now, CommitExtra::None)?;
    *record = next;
    Ok(Step::Advanced(EnvelopeStatus::Error))
}

/// Record the first time the owner read the envelope.
pub fn on_handle_read(record: &mut Envelope, now: Timestamp) -> Step {
    if record.read_at.is_some() {
        return Step::Unchanged;
    }
    record.document.read_at = Some(now);
    record.read_at = Some(now);
    record.updated_at = now;
    Step::Updated
}
