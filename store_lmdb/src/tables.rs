//! Key layouts and row codecs shared by read and write transactions.

use std::ops::Bound;

use heed::types::Bytes;
use heed::{Database, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use saga_types::{
    DispatchEvent, Envelope, EnvelopeId, EventType, PendingTransaction, ScopeSnapshot,
    SnapshotKey, StreamCheckpoint, TxHash,
};

use crate::environment::Databases;
use crate::LmdbError;

const ID_LEN: usize = 16;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LmdbError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Smallest byte string greater than every string starting with `prefix`.
/// Returns `None` when no such bound exists (all bytes are 0xFF).
fn increment_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// Every (key, value) pair whose key starts with `prefix`.
fn scan_prefix<'t>(
    txn: &'t RoTxn<'_>,
    db: Database<Bytes, Bytes>,
    prefix: &[u8],
) -> Result<Vec<(&'t [u8], &'t [u8])>, LmdbError> {
    let upper = increment_prefix(prefix);
    let bounds = (
        Bound::Included(prefix),
        match upper.as_deref() {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        },
    );
    let mut out = Vec::new();
    for result in db.range(txn, &bounds)? {
        out.push(result?);
    }
    Ok(out)
}

fn composite(prefix: &[u8; ID_LEN], id: &EnvelopeId) -> [u8; 2 * ID_LEN] {
    let mut key = [0u8; 2 * ID_LEN];
    key[..ID_LEN].copy_from_slice(prefix);
    key[ID_LEN..].copy_from_slice(id.as_bytes());
    key
}

fn event_key(envelope: &EnvelopeId, event_type: EventType) -> [u8; ID_LEN + 1] {
    let mut key = [0u8; ID_LEN + 1];
    key[..ID_LEN].copy_from_slice(envelope.as_bytes());
    key[ID_LEN] = event_type.code();
    key
}

// ── Envelopes ───────────────────────────────────────────────────────────

pub(crate) fn get_envelope(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    id: &EnvelopeId,
) -> Result<Option<Envelope>, LmdbError> {
    dbs.envelope
        .get(txn, id.as_bytes())?
        .map(decode)
        .transpose()
}

/// Resolve the envelope ids stored under `prefix` in a secondary index.
pub(crate) fn envelopes_by_index(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    index: Database<Bytes, Bytes>,
    table: &'static str,
    prefix: &[u8; ID_LEN],
) -> Result<Vec<Envelope>, LmdbError> {
    let mut out = Vec::new();
    for (key, _) in scan_prefix(txn, index, prefix)? {
        let id: [u8; ID_LEN] = key[ID_LEN..]
            .try_into()
            .map_err(|_| LmdbError::CorruptKey {
                table,
                detail: format!("key length {}", key.len()),
            })?;
        let id = EnvelopeId::from_bytes(id);
        let envelope = get_envelope(txn, dbs, &id)?.ok_or_else(|| LmdbError::CorruptKey {
            table,
            detail: format!("dangling envelope {id}"),
        })?;
        out.push(envelope);
    }
    Ok(out)
}

pub(crate) fn envelope_count(txn: &RoTxn<'_>, dbs: &Databases) -> Result<u64, LmdbError> {
    Ok(dbs.envelope.len(txn)?)
}

/// Write the row and its index entries. Identity columns of an existing row
/// never change, so index entries are only ever added.
pub(crate) fn put_envelope(
    txn: &mut RwTxn<'_>,
    dbs: &Databases,
    envelope: &Envelope,
) -> Result<(), LmdbError> {
    let bytes = encode(envelope)?;
    dbs.envelope.put(txn, envelope.id.as_bytes(), &bytes)?;
    dbs.by_execution.put(
        txn,
        &composite(envelope.execution_id.as_bytes(), &envelope.id),
        &[],
    )?;
    dbs.by_group
        .put(txn, &composite(envelope.group_id.as_bytes(), &envelope.id), &[])?;
    dbs.by_scope
        .put(txn, &composite(envelope.scope_id.as_bytes(), &envelope.id), &[])?;
    Ok(())
}

// ── Dispatch events ─────────────────────────────────────────────────────

pub(crate) fn get_event(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    envelope: &EnvelopeId,
    event_type: EventType,
) -> Result<Option<DispatchEvent>, LmdbError> {
    dbs.event
        .get(txn, &event_key(envelope, event_type))?
        .map(decode)
        .transpose()
}

pub(crate) fn events_for_envelope(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    envelope: &EnvelopeId,
) -> Result<Vec<DispatchEvent>, LmdbError> {
    scan_prefix(txn, dbs.event, envelope.as_bytes())?
        .into_iter()
        .map(|(_, val)| decode(val))
        .collect()
}

pub(crate) fn iter_events(
    txn: &RoTxn<'_>,
    dbs: &Databases,
) -> Result<Vec<DispatchEvent>, LmdbError> {
    let mut out = Vec::new();
    for result in dbs.event.iter(txn)? {
        let (_, val) = result?;
        out.push(decode(val)?);
    }
    Ok(out)
}

pub(crate) fn put_event(
    txn: &mut RwTxn<'_>,
    dbs: &Databases,
    event: &DispatchEvent,
) -> Result<(), LmdbError> {
    let bytes = encode(event)?;
    dbs.event
        .put(txn, &event_key(&event.envelope_id, event.event_type), &bytes)?;
    Ok(())
}

// ── Checkpoints ─────────────────────────────────────────────────────────

pub(crate) fn get_checkpoint(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    consumer: &str,
) -> Result<Option<StreamCheckpoint>, LmdbError> {
    dbs.event_stream
        .get(txn, consumer.as_bytes())?
        .map(decode)
        .transpose()
}

pub(crate) fn put_checkpoint(
    txn: &mut RwTxn<'_>,
    dbs: &Databases,
    checkpoint: &StreamCheckpoint,
) -> Result<(), LmdbError> {
    let bytes = encode(checkpoint)?;
    dbs.event_stream
        .put(txn, checkpoint.id.as_bytes(), &bytes)?;
    Ok(())
}

// ── Scope snapshots ─────────────────────────────────────────────────────

pub(crate) fn get_snapshot(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    key: &SnapshotKey,
) -> Result<Option<ScopeSnapshot>, LmdbError> {
    dbs.index_scope
        .get(txn, &key.to_bytes())?
        .map(decode)
        .transpose()
}

pub(crate) fn snapshots_for_scope(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    scope: &saga_types::ScopeId,
) -> Result<Vec<ScopeSnapshot>, LmdbError> {
    scan_prefix(txn, dbs.index_scope, scope.as_bytes())?
        .into_iter()
        .map(|(_, val)| decode(val))
        .collect()
}

pub(crate) fn put_snapshot(
    txn: &mut RwTxn<'_>,
    dbs: &Databases,
    snapshot: &ScopeSnapshot,
) -> Result<(), LmdbError> {
    let bytes = encode(snapshot)?;
    dbs.index_scope
        .put(txn, &snapshot.key.to_bytes(), &bytes)?;
    Ok(())
}

// ── Pending transactions ────────────────────────────────────────────────

pub(crate) fn get_transaction(
    txn: &RoTxn<'_>,
    dbs: &Databases,
    hash: &TxHash,
) -> Result<Option<PendingTransaction>, LmdbError> {
    dbs.transaction_status
        .get(txn, hash.as_bytes())?
        .map(decode)
        .transpose()
}

pub(crate) fn iter_transactions(
    txn: &RoTxn<'_>,
    dbs: &Databases,
) -> Result<Vec<PendingTransaction>, LmdbError> {
    let mut out = Vec::new();
    for result in dbs.transaction_status.iter(txn)? {
        let (_, val) = result?;
        out.push(decode(val)?);
    }
    Ok(out)
}

pub(crate) fn put_transaction(
    txn: &mut RwTxn<'_>,
    dbs: &Databases,
    tx: &PendingTransaction,
) -> Result<(), LmdbError> {
    let bytes = encode(tx)?;
    dbs.transaction_status
        .put(txn, tx.tx_hash.as_bytes(), &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_prefix_carries() {
        assert_eq!(increment_prefix(&[1, 2, 3]), Some(vec![1, 2, 4]));
        assert_eq!(increment_prefix(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(increment_prefix(&[0xFF, 0xFF]), None);
    }
}
