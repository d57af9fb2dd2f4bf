//! Shared harness: a fully wired node over in-memory collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use saga_collab::{ChainEvent, StreamBlock, TxResult};
use saga_node::{Collaborators, SagaConfig, SagaNode};
use saga_nullables::{
    NullChainNode, NullClock, NullFieldExtractor, NullPeer, NullScopeLookup, NullSearchIndex,
    NullStore, NullSubmitter,
};
use saga_store::SagaStore;
use saga_types::{
    DispatchEvent, Envelope, EnvelopeId, EventType, ExecutionId, Fact, GroupId, PartyKey,
    PartySignature, PendingTransaction, Recital, RecordGroup, Scope, ScopeId, SubEnvelope,
    Timestamp, TxHash,
};

pub const START_SECS: u64 = 1_700_000_000;

pub fn party(n: u8) -> PartyKey {
    PartyKey::from_public_key(&[n; 33])
}

pub fn invoker() -> PartyKey {
    party(1)
}

pub fn servicer() -> PartyKey {
    party(2)
}

/// A two-party proposal: the invoker and one servicer.
pub fn proposal(expiration: Option<Timestamp>) -> SubEnvelope {
    SubEnvelope::new(
        ExecutionId::random(),
        GroupId::random(),
        ScopeId::random(),
        "io.contract.Loan",
        vec![
            Recital {
                role: "OWNER".into(),
                party: invoker(),
            },
            Recital {
                role: "SERVICER".into(),
                party: servicer(),
            },
        ],
        expiration,
    )
}

pub fn signed_by(sub: &SubEnvelope, parties: &[PartyKey]) -> SubEnvelope {
    let mut sub = sub.clone();
    for p in parties {
        sub.signatures.push(PartySignature {
            signer: p.clone(),
            signature: p.as_str().as_bytes().to_vec(),
        });
    }
    sub
}

/// The on-chain scope after `sub`'s execution was written.
pub fn chain_scope(sub: &SubEnvelope) -> Scope {
    let mut scope = Scope::new(sub.scope_id, vec![invoker(), servicer()]);
    scope.record_groups.push(RecordGroup {
        group_id: sub.group_id,
        execution_id: sub.execution_id,
        contract: sub.contract.clone(),
        facts: vec![Fact {
            name: "loan".into(),
            hash: "c2FnYQ==".into(),
        }],
        created_at: Timestamp::from_secs(START_SECS),
        updated_at: None,
    });
    scope
}

/// A block carrying one transaction that updated `sub`'s scope.
pub fn scope_block(height: u64, tx_hash: TxHash, sub: &SubEnvelope, code: u32) -> StreamBlock {
    let event = ChainEvent::new("scope_updated")
        .with_attribute("scope_id", sub.scope_id.to_string())
        .with_attribute("group_id", sub.group_id.to_string());
    StreamBlock {
        height,
        time: Timestamp::from_secs(START_SECS + height),
        txs: vec![TxResult {
            hash: tx_hash,
            code,
            raw_log: if code == 0 {
                String::new()
            } else {
                "out of gas".into()
            },
            events: vec![event],
        }],
    }
}

pub fn empty_block(height: u64) -> StreamBlock {
    StreamBlock {
        height,
        time: Timestamp::from_secs(START_SECS + height),
        txs: Vec::new(),
    }
}

pub struct Harness {
    pub node: SagaNode,
    pub store: Arc<NullStore>,
    pub clock: Arc<NullClock>,
    pub peer: Arc<NullPeer>,
    pub submitter: Arc<NullSubmitter>,
    pub lookup: Arc<NullScopeLookup>,
    pub search: Arc<NullSearchIndex>,
    pub chain: Arc<NullChainNode>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SagaConfig::default())
    }

    pub fn with_config(config: SagaConfig) -> Self {
        let store = Arc::new(NullStore::new());
        let clock = Arc::new(NullClock::new(START_SECS));
        let peer = Arc::new(NullPeer::new());
        let submitter = Arc::new(NullSubmitter::new());
        let lookup = Arc::new(NullScopeLookup::new());
        let search = Arc::new(NullSearchIndex::new());
        let chain = Arc::new(NullChainNode::new(config.stream.query_limit));

        let collaborators = Collaborators {
            peer: peer.clone(),
            submitter: submitter.clone(),
            lookup: lookup.clone(),
            extractor: Arc::new(NullFieldExtractor),
            search: search.clone(),
            chain: chain.clone(),
        };
        let node = SagaNode::with_store(config, store.clone(), collaborators, clock.clone())
            .expect("node wires");

        Self {
            node,
            store,
            clock,
            peer,
            submitter,
            lookup,
            search,
            chain,
        }
    }

    pub fn envelope(&self, id: EnvelopeId) -> Envelope {
        self.node.lifecycle().envelope(&id).expect("envelope exists")
    }

    pub fn event(&self, id: EnvelopeId, kind: EventType) -> Option<DispatchEvent> {
        self.store.read().unwrap().get_event(&id, kind).unwrap()
    }

    pub fn transaction(&self, hash: &TxHash) -> Option<PendingTransaction> {
        self.store.read().unwrap().get_transaction(hash).unwrap()
    }

    /// Drive a fresh proposal until the invoker copy is SIGNED and its
    /// submission has run. Returns (invoker copy, servicer copy, proposal).
    pub async fn signed_pair(&self, expiration: Option<Timestamp>) -> (EnvelopeId, EnvelopeId, SubEnvelope) {
        let input = proposal(expiration);
        let lifecycle = self.node.lifecycle();

        let a = lifecycle.create(invoker(), input.clone()).await.unwrap();
        let b = lifecycle.receive(servicer(), input.clone()).unwrap();
        lifecycle
            .record_execution(b, signed_by(&input, &[servicer()]))
            .await
            .unwrap();
        lifecycle.record_outbox(b).await.unwrap();
        lifecycle
            .record_signature(a, &signed_by(&input, &[invoker(), servicer()]))
            .await
            .unwrap();
        (a, b, input)
    }

    /// Poll `done` until it holds, failing the test after two seconds.
    pub async fn wait_for(&self, what: &str, done: impl Fn(&Harness) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !done(self) {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
