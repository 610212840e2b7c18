/// Validation logic for transactions separated from type definitions
use crate::blockchain::Block;
use crate::error::Result;
use crate::persistence::LedgerStore;
use crate::transaction::types::{Input, Transaction};
use std::collections::HashSet;

/// Read access to the set of transaction ids committed in some chain.
///
/// The chain may be the local ledger or a candidate chain under evaluation.
pub trait ChainView {
    fn contains_transaction(&self, transaction_id: u64) -> Result<bool>;
}

impl ChainView for HashSet<u64> {
    fn contains_transaction(&self, transaction_id: u64) -> Result<bool> {
        Ok(self.contains(&transaction_id))
    }
}

impl ChainView for [Block] {
    fn contains_transaction(&self, transaction_id: u64) -> Result<bool> {
        Ok(self.iter().any(|b| b.contains_transaction(transaction_id)))
    }
}

impl ChainView for dyn LedgerStore {
    fn contains_transaction(&self, transaction_id: u64) -> Result<bool> {
        Ok(self.find_transaction(transaction_id)?.is_some())
    }
}

impl Transaction {
    /// Stateless checks on the transaction itself.
    ///
    /// Signature and contract semantics are not verified yet; this is the
    /// hook where that verification lands without changing callers.
    pub fn check(&self) -> Result<()> {
        self.data.input.verify_signature()
    }
}

impl Input {
    pub fn verify_signature(&self) -> Result<()> {
        Ok(())
    }
}
