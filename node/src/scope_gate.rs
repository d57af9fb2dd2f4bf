//! At most one in-flight chain submission per scope.
//!
//! The chaincode reaper takes a scope's slot before submitting and gives it
//! back when the submission fails. A successful submission keeps the slot
//! until the checkpointer observes the scope's mutation on chain (or the
//! pending-transaction sweeper gives up on it).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use saga_types::{ExecutionId, ScopeId};

#[derive(Default)]
pub struct ScopeGate {
    slots: Mutex<HashMap<ScopeId, ExecutionId>>,
}

impl ScopeGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ScopeId, ExecutionId>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the slot for `scope`. Re-entrant for the execution already holding it.
    pub fn try_acquire(&self, scope: ScopeId, execution: ExecutionId) -> bool {
        let mut slots = self.slots();
        match slots.get(&scope) {
            Some(holder) => *holder == execution,
            None => {
                slots.insert(scope, execution);
                true
            }
        }
    }

    /// Give the slot back if `execution` holds it.
    pub fn release_held(&self, scope: &ScopeId, execution: &ExecutionId) -> bool {
        let mut slots = self.slots();
        if slots.get(scope) == Some(execution) {
            slots.remove(scope);
            true
        } else {
            false
        }
    }

    /// Free the slot regardless of holder.
    pub fn release(&self, scope: &ScopeId) -> Option<ExecutionId> {
        self.slots().remove(scope)
    }

    pub fn holder(&self, scope: &ScopeId) -> Option<ExecutionId> {
        self.slots().get(scope).copied()
    }

    pub fn in_flight(&self) -> usize {
        self.slots().len()
    }
}
