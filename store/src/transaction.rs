//! Submitted chain transactions awaiting confirmation.

use saga_types::{PendingTransaction, TxHash};

use crate::StoreError;

pub trait TransactionReader {
    fn get_transaction(&self, hash: &TxHash) -> Result<Option<PendingTransaction>, StoreError>;

    fn iter_transactions(&self) -> Result<Vec<PendingTransaction>, StoreError>;
}

pub trait TransactionWriter {
    fn put_transaction(&mut self, tx: &PendingTransaction) -> Result<(), StoreError>;
}
