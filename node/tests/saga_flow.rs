//! End-to-end saga scenarios over a wired node with in-memory collaborators.

mod common;

use common::*;
use saga_collab::{CollabError, TxReceipt};
use saga_node::state_machine::{
    on_handle_chaincode, on_handle_execute, on_handle_index, on_handle_outbox, on_handle_receive,
    on_handle_sign,
};
use saga_node::{LifecycleError, Step};
use saga_nullables::{NullSubmitter, PeerCall};
use saga_store::SagaStore;
use saga_types::{
    EnvelopeErrorKind, EnvelopeId, EnvelopeStatus, EventPayload, EventStatus, EventType, Timestamp,
    TxHash, TxStatus,
};

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn proposal_runs_to_complete() {
    let h = Harness::new();
    let lifecycle = h.node.lifecycle();
    let input = proposal(None);

    let a = lifecycle.create(invoker(), input.clone()).await.unwrap();
    assert_eq!(h.envelope(a).status, EnvelopeStatus::Fragment);
    assert_eq!(
        h.peer.deliveries(),
        vec![PeerCall::Deliver {
            envelope: a,
            target: servicer(),
            status: EnvelopeStatus::Created,
        }]
    );

    let b = lifecycle.receive(servicer(), input.clone()).unwrap();
    assert_eq!(h.envelope(b).status, EnvelopeStatus::Inbox);
    assert_eq!(
        lifecycle
            .record_execution(b, signed_by(&input, &[servicer()]))
            .await
            .unwrap(),
        Step::Advanced(EnvelopeStatus::Executed)
    );
    assert_eq!(
        lifecycle.record_outbox(b).await.unwrap(),
        Step::Advanced(EnvelopeStatus::Outbox)
    );

    let step = lifecycle
        .record_signature(a, &signed_by(&input, &[invoker(), servicer()]))
        .await
        .unwrap();
    assert_eq!(step, Step::Advanced(EnvelopeStatus::Signed));

    // Both copies of the execution ride the one submission.
    let tx = NullSubmitter::hash_for(1);
    assert_eq!(h.submitter.submissions(), vec![input.execution_id]);
    for id in [a, b] {
        let record = h.envelope(id);
        assert_eq!(record.status, EnvelopeStatus::Chaincode);
        assert_eq!(record.chain_tx, Some(tx));
    }
    assert_eq!(h.transaction(&tx).unwrap().status, TxStatus::Pending);
    assert_eq!(h.node.gate().holder(&input.scope_id), Some(input.execution_id));

    h.lookup.put_scope(chain_scope(&input));
    let report = h
        .node
        .checkpointer()
        .process(vec![scope_block(7, tx, &input, 0)])
        .await
        .unwrap();
    assert_eq!(report.snapshots, 1);
    assert_eq!(report.settled, 1);
    assert_eq!(report.checkpoint, Some(7));
    assert_eq!(report.staged.len(), 2);
    assert!(h.node.gate().holder(&input.scope_id).is_none());

    h.wait_for("both copies indexed", |h| {
        [a, b]
            .iter()
            .all(|id| h.envelope(*id).status == EnvelopeStatus::Index)
    })
    .await;
    assert_eq!(h.transaction(&tx).unwrap().status, TxStatus::Success);

    let mut documents: Vec<String> = h.search.writes().into_iter().map(|w| w.document_id).collect();
    documents.sort();
    let mut expected = vec![
        format!("{}:{}", input.scope_id, invoker()),
        format!("{}:{}", input.scope_id, servicer()),
    ];
    expected.sort();
    assert_eq!(documents, expected);

    let indexed = h.envelope(a);
    let outputs = &indexed.result().unwrap().outputs;
    assert!(outputs.iter().any(|f| f.name == "loan"));

    assert_eq!(
        lifecycle.acknowledge(a).await.unwrap(),
        Step::Advanced(EnvelopeStatus::Complete)
    );
    assert_eq!(h.envelope(a).status, EnvelopeStatus::Complete);
}

#[tokio::test]
async fn acknowledge_requires_an_indexed_envelope() {
    let h = Harness::new();
    let b = h.node.lifecycle().receive(servicer(), proposal(None)).unwrap();

    let err = h.node.lifecycle().acknowledge(b).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::WrongStatus {
            status: EnvelopeStatus::Inbox,
            ..
        }
    ));
}

#[tokio::test]
async fn first_read_is_recorded_once() {
    let h = Harness::new();
    let b = h.node.lifecycle().receive(servicer(), proposal(None)).unwrap();

    assert_eq!(h.node.lifecycle().mark_read(b).unwrap(), Step::Updated);
    let first = h.envelope(b).read_at;
    h.clock.advance_secs(30);
    assert_eq!(h.node.lifecycle().mark_read(b).unwrap(), Step::Unchanged);
    assert_eq!(h.envelope(b).read_at, first);
    assert_eq!(h.envelope(b).status, EnvelopeStatus::Inbox);
}

// ---------------------------------------------------------------------------
// Expiration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_proposal_is_never_delivered() {
    let h = Harness::new();
    let deadline = Timestamp::from_secs(START_SECS - 60);

    let a = h
        .node
        .lifecycle()
        .create(invoker(), proposal(Some(deadline)))
        .await
        .unwrap();

    let record = h.envelope(a);
    assert_eq!(record.status, EnvelopeStatus::Error);
    assert_eq!(
        record.document.last_error().map(|e| e.kind),
        Some(EnvelopeErrorKind::TtlTimeout)
    );
    assert!(h.peer.calls().is_empty());
    assert_eq!(
        h.event(a, EventType::EnvelopeFragment).unwrap().status,
        EventStatus::Complete
    );
}

#[tokio::test]
async fn expired_signed_envelope_is_not_submitted() {
    let h = Harness::new();
    let deadline = Timestamp::from_secs(START_SECS + 60);
    let input = proposal(Some(deadline));
    let lifecycle = h.node.lifecycle();

    let a = lifecycle.create(invoker(), input.clone()).await.unwrap();
    h.clock.advance_secs(120);
    lifecycle
        .record_signature(a, &signed_by(&input, &[invoker(), servicer()]))
        .await
        .unwrap();

    assert!(h.submitter.submissions().is_empty());
    let record = h.envelope(a);
    assert_eq!(record.status, EnvelopeStatus::Error);
    assert_eq!(
        record.document.last_error().map(|e| e.kind),
        Some(EnvelopeErrorKind::TtlTimeout)
    );

    let notified: Vec<_> = h
        .peer
        .notifications()
        .into_iter()
        .filter_map(|call| match call {
            PeerCall::NotifyError { target, kind, .. } => Some((target, kind)),
            PeerCall::Deliver { .. } => None,
        })
        .collect();
    assert!(notified.contains(&(invoker(), EnvelopeErrorKind::TtlTimeout)));
    assert!(notified.contains(&(servicer(), EnvelopeErrorKind::TtlTimeout)));
}

// ---------------------------------------------------------------------------
// Replays and races
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivered_fragment_trigger_is_a_no_op() {
    let h = Harness::new();
    let a = h
        .node
        .lifecycle()
        .create(invoker(), proposal(None))
        .await
        .unwrap();
    let before = h.envelope(a);

    let status = h
        .node
        .dispatcher()
        .submit(a, EventType::EnvelopeFragment, EventPayload::Envelope)
        .await
        .unwrap();

    assert_eq!(status, EventStatus::Complete);
    assert_eq!(h.peer.deliveries().len(), 1);
    assert_eq!(h.envelope(a), before);
}

#[tokio::test]
async fn signed_copies_share_one_submission() {
    let h = Harness::new();
    let input = proposal(None);
    let lifecycle = h.node.lifecycle();
    let fully_signed = signed_by(&input, &[invoker(), servicer()]);

    let a = lifecycle.create(invoker(), input.clone()).await.unwrap();
    let b = lifecycle.receive(servicer(), input.clone()).unwrap();
    lifecycle
        .record_execution(b, signed_by(&input, &[servicer()]))
        .await
        .unwrap();
    lifecycle.record_outbox(b).await.unwrap();

    // The servicer's copy reaches SIGNED first and submits nothing.
    assert_eq!(
        lifecycle.record_signature(b, &fully_signed).await.unwrap(),
        Step::Advanced(EnvelopeStatus::Signed)
    );
    assert!(h.submitter.submissions().is_empty());
    assert!(h.event(b, EventType::EnvelopeChaincode).is_none());

    lifecycle.record_signature(a, &fully_signed).await.unwrap();
    assert_eq!(h.submitter.submissions().len(), 1);
    for id in [a, b] {
        assert_eq!(h.envelope(id).status, EnvelopeStatus::Chaincode);
    }

    // A late trigger for an already submitted copy does nothing.
    let status = h
        .node
        .dispatcher()
        .submit(b, EventType::EnvelopeChaincode, EventPayload::Envelope)
        .await
        .unwrap();
    assert_eq!(status, EventStatus::Complete);
    assert_eq!(h.submitter.submissions().len(), 1);
}

#[tokio::test]
async fn submission_leaves_an_indexed_copy_untouched() {
    let h = Harness::new();
    let input = proposal(None);
    let lifecycle = h.node.lifecycle();
    let fully_signed = signed_by(&input, &[invoker(), servicer()]);

    let a = lifecycle.create(invoker(), input.clone()).await.unwrap();
    let b = lifecycle.receive(servicer(), input.clone()).unwrap();
    lifecycle
        .record_execution(b, signed_by(&input, &[servicer()]))
        .await
        .unwrap();
    lifecycle.record_outbox(b).await.unwrap();
    lifecycle.record_signature(b, &fully_signed).await.unwrap();

    // A third copy of the same execution that already reached INDEX.
    let now = Timestamp::from_secs(START_SECS);
    let mut indexed = on_handle_receive(EnvelopeId::random(), party(3), input.clone(), now);
    on_handle_execute(&mut indexed, signed_by(&input, &[servicer()]), now).unwrap();
    on_handle_outbox(&mut indexed, now).unwrap();
    on_handle_sign(&mut indexed, &fully_signed, now).unwrap();
    on_handle_chaincode(&mut indexed, TxHash::new([7; 32]), now).unwrap();
    on_handle_index(&mut indexed, &chain_scope(&input), now).unwrap();
    assert_eq!(indexed.status, EnvelopeStatus::Index);
    {
        let mut txn = h.store.write().unwrap();
        txn.put_envelope(&indexed).unwrap();
        txn.commit().unwrap();
    }
    let before = h.envelope(indexed.id);

    h.clock.advance_secs(5);
    lifecycle.record_signature(a, &fully_signed).await.unwrap();

    assert_eq!(h.submitter.submissions(), vec![input.execution_id]);
    for id in [a, b] {
        assert_eq!(h.envelope(id).status, EnvelopeStatus::Chaincode);
    }
    let after = h.envelope(indexed.id);
    assert_eq!(after.document, before.document);
    assert_eq!(after.stamps, before.stamps);
    assert_eq!(after, before);
}

#[tokio::test]
async fn index_retry_writes_documents_for_copies_already_indexed() {
    let h = Harness::new();
    let (a, b, input) = h.signed_pair(None).await;
    h.lookup.put_scope(chain_scope(&input));
    h.search
        .set_failure(Some(CollabError::Transient("search unavailable".into())));

    h.node
        .checkpointer()
        .process(vec![scope_block(5, NullSubmitter::hash_for(1), &input, 0)])
        .await
        .unwrap();

    let index_slot = move |h: &Harness| {
        [a, b]
            .into_iter()
            .find_map(|id| h.event(id, EventType::ScopeIndex))
    };
    h.wait_for("fragment copy indexed while the index trigger waits", |h| {
        let Some(slot) = index_slot(h) else {
            return false;
        };
        let other = if slot.envelope_id == a { b } else { a };
        slot.status == EventStatus::Error && h.envelope(other).status == EnvelopeStatus::Index
    })
    .await;
    let slot = index_slot(&h).unwrap();
    assert!(slot.is_retryable());
    assert!(h.search.writes().is_empty());

    h.search.set_failure(None);
    let status = h.node.dispatcher().fire(slot).await.unwrap();
    assert_eq!(status, EventStatus::Complete);

    let mut documents: Vec<String> = h.search.writes().into_iter().map(|w| w.document_id).collect();
    documents.sort();
    let mut expected = vec![
        format!("{}:{}", input.scope_id, invoker()),
        format!("{}:{}", input.scope_id, servicer()),
    ];
    expected.sort();
    assert_eq!(documents, expected);
    for id in [a, b] {
        assert_eq!(h.envelope(id).status, EnvelopeStatus::Index);
    }
}

#[tokio::test]
async fn replayed_signature_does_not_submit_again() {
    let h = Harness::new();
    h.submitter
        .push_outcome(Err(CollabError::Transient("node unavailable".into())));
    let (a, _, input) = h.signed_pair(None).await;
    assert_eq!(h.envelope(a).status, EnvelopeStatus::Signed);
    assert_eq!(h.submitter.submissions().len(), 1);
    let before = h.envelope(a);

    let step = h
        .node
        .lifecycle()
        .record_signature(a, &signed_by(&input, &[invoker(), servicer()]))
        .await
        .unwrap();

    assert_eq!(step, Step::Unchanged);
    assert_eq!(h.envelope(a), before);
    assert_eq!(h.submitter.submissions().len(), 1);
    assert_eq!(h.event(a, EventType::EnvelopeChaincode).unwrap().attempts, 1);
}

#[tokio::test]
async fn group_already_on_chain_is_indexed_without_submission() {
    let h = Harness::new();
    let input = proposal(None);
    h.lookup.put_scope(chain_scope(&input));
    let lifecycle = h.node.lifecycle();

    let a = lifecycle.create(invoker(), input.clone()).await.unwrap();
    lifecycle
        .record_signature(a, &signed_by(&input, &[invoker(), servicer()]))
        .await
        .unwrap();

    assert!(h.submitter.submissions().is_empty());
    assert_eq!(h.envelope(a).status, EnvelopeStatus::Index);
    assert_eq!(h.search.writes().len(), 1);
    assert!(h.node.gate().holder(&input.scope_id).is_none());

    // INDEX is past SIGNED: a chaincode re-trigger must not submit.
    h.node
        .dispatcher()
        .submit(a, EventType::EnvelopeChaincode, EventPayload::Envelope)
        .await
        .unwrap();
    assert!(h.submitter.submissions().is_empty());
    assert_eq!(h.envelope(a).status, EnvelopeStatus::Index);
}

#[tokio::test]
async fn second_execution_waits_for_the_scope() {
    let h = Harness::new();
    let (_, _, first) = h.signed_pair(None).await;

    // Another execution against the same scope while the first is unconfirmed.
    let mut second = proposal(None);
    second.scope_id = first.scope_id;
    let lifecycle = h.node.lifecycle();
    let c = lifecycle.create(invoker(), second.clone()).await.unwrap();
    lifecycle
        .record_signature(c, &signed_by(&second, &[invoker(), servicer()]))
        .await
        .unwrap();

    assert_eq!(h.submitter.submissions(), vec![first.execution_id]);
    assert_eq!(h.envelope(c).status, EnvelopeStatus::Signed);
    let slot = h.event(c, EventType::EnvelopeChaincode).unwrap();
    assert_eq!(slot.status, EventStatus::Error);
    assert!(slot.is_retryable());

    // Confirmation frees the scope; the sweeper picks the waiting one up.
    h.lookup.put_scope(chain_scope(&first));
    h.node
        .checkpointer()
        .process(vec![scope_block(3, NullSubmitter::hash_for(1), &first, 0)])
        .await
        .unwrap();
    assert_eq!(h.node.dispatch_sweeper().sweep().await.unwrap(), 1);
    assert_eq!(h.envelope(c).status, EnvelopeStatus::Chaincode);
    assert_eq!(h.submitter.submissions().len(), 2);
}

// ---------------------------------------------------------------------------
// Submission failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refused_submission_fails_the_envelope() {
    let h = Harness::new();
    h.submitter
        .push_outcome(Err(CollabError::Rejected("signature mismatch".into())));

    let (a, b, input) = h.signed_pair(None).await;

    let record = h.envelope(a);
    assert_eq!(record.status, EnvelopeStatus::Error);
    let error = record.document.last_error().unwrap();
    assert_eq!(error.kind, EnvelopeErrorKind::ContractInvocation);
    assert!(error.message.contains("signature mismatch"));
    assert_eq!(h.envelope(b).status, EnvelopeStatus::Outbox);
    assert!(h.node.gate().holder(&input.scope_id).is_none());
    assert_eq!(
        h.event(a, EventType::EnvelopeChaincode).unwrap().status,
        EventStatus::Complete
    );
}

#[tokio::test]
async fn non_zero_receipt_code_fails_the_envelope() {
    let h = Harness::new();
    h.submitter.push_outcome(Ok(TxReceipt {
        tx_hash: NullSubmitter::hash_for(99),
        code: 11,
        raw_log: "insufficient fee".into(),
    }));

    let (a, _, _) = h.signed_pair(None).await;

    let record = h.envelope(a);
    assert_eq!(record.status, EnvelopeStatus::Error);
    assert_eq!(record.document.last_error().unwrap().message, "insufficient fee");
    assert!(h.transaction(&NullSubmitter::hash_for(99)).is_none());
}

#[tokio::test]
async fn transient_submission_failure_is_swept_later() {
    let h = Harness::new();
    h.submitter
        .push_outcome(Err(CollabError::Transient("node unavailable".into())));

    let (a, _, input) = h.signed_pair(None).await;
    assert_eq!(h.envelope(a).status, EnvelopeStatus::Signed);
    let slot = h.event(a, EventType::EnvelopeChaincode).unwrap();
    assert_eq!(slot.status, EventStatus::Error);
    assert!(slot.is_retryable());
    assert!(h.node.gate().holder(&input.scope_id).is_none());

    assert_eq!(h.node.dispatch_sweeper().sweep().await.unwrap(), 1);
    assert_eq!(h.envelope(a).status, EnvelopeStatus::Chaincode);
    let slot = h.event(a, EventType::EnvelopeChaincode).unwrap();
    assert_eq!(slot.status, EventStatus::Complete);
    assert_eq!(slot.attempts, 2);

    // Nothing left to sweep.
    assert_eq!(h.node.dispatch_sweeper().sweep().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Chain outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_chain_transaction_fails_every_copy() {
    let h = Harness::new();
    let (a, b, input) = h.signed_pair(None).await;
    let tx = NullSubmitter::hash_for(1);

    let report = h
        .node
        .checkpointer()
        .process(vec![scope_block(4, tx, &input, 5)])
        .await
        .unwrap();
    assert_eq!(report.snapshots, 0);
    assert_eq!(report.settled, 1);

    let pending = h.transaction(&tx).unwrap();
    assert_eq!(pending.status, TxStatus::Error);
    assert_eq!(pending.raw_log.as_deref(), Some("out of gas"));
    for id in [a, b] {
        let record = h.envelope(id);
        assert_eq!(record.status, EnvelopeStatus::Error);
        assert_eq!(
            record.document.last_error().map(|e| e.kind),
            Some(EnvelopeErrorKind::ContractInvocation)
        );
    }
    assert!(h.node.gate().holder(&input.scope_id).is_none());

    h.wait_for("servicer notified", |h| {
        h.peer.notifications().iter().any(|call| {
            matches!(call, PeerCall::NotifyError { envelope, target, .. }
                if *envelope == a && *target == servicer())
        })
    })
    .await;
}

#[tokio::test]
async fn chain_scope_without_the_group_fails_the_trigger() {
    let h = Harness::new();
    let (a, b, input) = h.signed_pair(None).await;

    // The chain reports a scope that lacks this execution's group.
    let mut scope = chain_scope(&input);
    scope.record_groups.clear();
    h.lookup.put_scope(scope);
    h.node
        .checkpointer()
        .process(vec![scope_block(4, NullSubmitter::hash_for(1), &input, 0)])
        .await
        .unwrap();

    h.wait_for("both copies failed", |h| {
        let failed = [a, b]
            .iter()
            .all(|id| h.envelope(*id).status == EnvelopeStatus::Error);
        let recorded = [a, b].iter().any(|id| {
            h.event(*id, EventType::ScopeIndex)
                .is_some_and(|e| e.status == EventStatus::Error)
        });
        failed && recorded
    })
    .await;
    for id in [a, b] {
        assert_eq!(
            h.envelope(id).document.last_error().map(|e| e.kind),
            Some(EnvelopeErrorKind::RecordGroupMissing)
        );
    }
    let trigger = [a, b]
        .into_iter()
        .find_map(|id| h.event(id, EventType::ScopeIndex))
        .expect("one copy carries the index trigger");
    assert_eq!(trigger.status, EventStatus::Error);
    assert!(!trigger.is_retryable());
    assert!(h.search.writes().is_empty());
}

#[tokio::test]
async fn unconfirmed_submission_times_out() {
    let h = Harness::new();
    let (a, b, input) = h.signed_pair(None).await;
    let tx = NullSubmitter::hash_for(1);

    assert_eq!(h.node.pending_sweeper().sweep().await.unwrap(), 0);
    h.clock
        .advance_secs(h.node.config.sweeper.pending_tx_timeout_secs + 1);
    assert_eq!(h.node.pending_sweeper().sweep().await.unwrap(), 1);

    let pending = h.transaction(&tx).unwrap();
    assert_eq!(pending.status, TxStatus::Error);
    assert!(h.node.gate().holder(&input.scope_id).is_none());
    for id in [a, b] {
        assert_eq!(h.envelope(id).status, EnvelopeStatus::Chaincode);
    }

    // A late confirmation still indexes the copies.
    h.lookup.put_scope(chain_scope(&input));
    h.node
        .checkpointer()
        .process(vec![scope_block(9, tx, &input, 0)])
        .await
        .unwrap();
    h.wait_for("late confirmation indexed", |h| {
        h.envelope(a).status == EnvelopeStatus::Index
    })
    .await;
    assert_eq!(h.transaction(&tx).unwrap().status, TxStatus::Error);
}
