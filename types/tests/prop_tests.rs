use proptest::prelude::*;

use saga_types::{
    EnvelopeId, EnvelopeStatus, PhaseStamps, ScopeEventKind, ScopeId, SnapshotKey,
    StreamCheckpoint, Timestamp, TxHash,
};

fn status() -> impl Strategy<Value = EnvelopeStatus> {
    prop::sample::select(vec![
        EnvelopeStatus::Created,
        EnvelopeStatus::Fragment,
        EnvelopeStatus::Inbox,
        EnvelopeStatus::Executed,
        EnvelopeStatus::Outbox,
        EnvelopeStatus::Signed,
        EnvelopeStatus::Chaincode,
        EnvelopeStatus::Index,
        EnvelopeStatus::Complete,
        EnvelopeStatus::Error,
    ])
}

proptest! {
    /// Checkpoint height is the running maximum of every advance.
    #[test]
    fn checkpoint_is_running_max(start in 0u64..1_000, heights in prop::collection::vec(0u64..2_000, 0..50)) {
        let mut cp = StreamCheckpoint::new("c", start, Timestamp::EPOCH);
        let mut expected = start;
        for (i, h) in heights.iter().enumerate() {
            cp.advance(*h, Timestamp::from_millis(i as u64));
            expected = expected.max(*h);
            prop_assert_eq!(cp.last_block_height, expected);
        }
    }

    /// Phase stamps never move backwards, whatever order they are written in.
    #[test]
    fn phase_stamps_monotonic(phase in status(), writes in prop::collection::vec(0u64..10_000, 1..20)) {
        let mut stamps = PhaseStamps::default();
        let mut max = None;
        for w in writes {
            stamps.set(phase, Timestamp::from_millis(w));
            if phase.rank().is_some() && phase != EnvelopeStatus::Created {
                max = Some(max.map_or(w, |m: u64| m.max(w)));
            }
        }
        prop_assert_eq!(stamps.get(phase).map(|t| t.as_millis()), max);
    }

    /// `is_past` is a strict order on the ranked phases; ERROR is never past nor passed.
    #[test]
    fn is_past_is_strict(a in status(), b in status()) {
        if a.is_past(b) {
            prop_assert!(!b.is_past(a));
            prop_assert!(a != b);
        }
        if a == EnvelopeStatus::Error || b == EnvelopeStatus::Error {
            prop_assert!(!a.is_past(b));
        }
    }

    /// Status names parse back to the same status.
    #[test]
    fn status_name_round_trip(s in status()) {
        prop_assert_eq!(s.as_str().parse::<EnvelopeStatus>().unwrap(), s);
        prop_assert_eq!(s.as_str().to_lowercase().parse::<EnvelopeStatus>().unwrap(), s);
    }

    /// Snapshot keys sort by scope first, so a scope's snapshots are contiguous.
    #[test]
    fn snapshot_keys_group_by_scope(a in prop::array::uniform16(0u8..), b in prop::array::uniform32(0u8..), c in prop::array::uniform32(0u8..)) {
        let scope = ScopeId::from_bytes(a);
        let k1 = SnapshotKey::new(scope, TxHash::new(b), ScopeEventKind::Created);
        let k2 = SnapshotKey::new(scope, TxHash::new(c), ScopeEventKind::Ownership);
        prop_assert_eq!(&k1.to_bytes()[..16], &k2.to_bytes()[..16]);
    }

    /// Ids survive their textual form.
    #[test]
    fn envelope_id_display_parse(bytes in prop::array::uniform16(0u8..)) {
        let id = EnvelopeId::from_bytes(bytes);
        prop_assert_eq!(id.to_string().parse::<EnvelopeId>().unwrap(), id);
    }
}

#[test]
fn statuses_are_persisted_by_name() {
    let encoded = bincode::serialize(&EnvelopeStatus::Chaincode).unwrap();
    let name: String = bincode::deserialize(&encoded).unwrap();
    assert_eq!(name, "CHAINCODE");
    let decoded: EnvelopeStatus = bincode::deserialize(&encoded).unwrap();
    assert_eq!(decoded, EnvelopeStatus::Chaincode);
}
