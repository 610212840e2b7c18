//! The admission engine: the only writer of the ledger and the mempool.
//!
//! Every mutation runs under one async writer lock, so two blocks built on
//! the same tip cannot both commit. Reads go straight to the stores.

use super::block::Block;
use super::validation::Validator;
use crate::error::{ChainError, Result, ValidationError};
use crate::persistence::{LedgerStore, MempoolStore};
use crate::transaction::Transaction;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What a successful chain replacement changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    /// Local blocks that were rolled back.
    pub dropped: Vec<Block>,
    /// Blocks written in their place, index ascending.
    pub adopted: Vec<Block>,
    /// Transaction ids returned to the mempool by the rollback.
    pub restored: Vec<u64>,
}

impl Replacement {
    pub fn new_tip(&self) -> Option<&Block> {
        self.adopted.last()
    }
}

pub struct Blockchain {
    ledger: Arc<dyn LedgerStore>,
    mempool: Arc<dyn MempoolStore>,
    validator: Validator,
    write_lock: Mutex<()>,
}

impl Blockchain {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        mempool: Arc<dyn MempoolStore>,
        validator: Validator,
    ) -> Self {
        Self {
            ledger,
            mempool,
            validator,
            write_lock: Mutex::new(()),
        }
    }

    /// Seed genesis into an empty ledger, otherwise drop mempool entries the
    /// ledger already commits. Returns the tip.
    pub async fn init(&self) -> Result<Block> {
        let _guard = self.write_lock.lock().await;

        if self.ledger.is_empty()? {
            let genesis = Block::genesis();
            self.ledger.append(&genesis)?;
            info!(hash = %genesis.short_hash(), "seeded genesis block");
            return Ok(genesis);
        }

        let mut pruned = 0usize;
        for tx in self.mempool.all()? {
            if self.ledger.find_transaction(tx.transaction_id)?.is_some() {
                self.mempool.remove(tx.transaction_id)?;
                pruned += 1;
            }
        }
        let tip = self.tip()?;
        info!(height = tip.index, pruned, "loaded existing ledger");
        Ok(tip)
    }

    /// Validate `block` against the current tip and commit it.
    pub async fn add_block(&self, block: Block) -> Result<Block> {
        let _guard = self.write_lock.lock().await;

        let tip = self.tip()?;
        self.validator
            .validate_block(&block, &tip, self.ledger.as_ref())?;
        self.ledger.append(&block)?;
        self.evict(block.transaction_ids());

        info!(
            index = block.index,
            hash = %block.short_hash(),
            transactions = block.transactions.len(),
            "block committed"
        );
        Ok(block)
    }

    /// Admit `tx` to the mempool. An id already committed or already pending
    /// is a duplicate.
    pub async fn add_transaction(&self, tx: Transaction) -> Result<Transaction> {
        let tx = tx.with_hash();
        let _guard = self.write_lock.lock().await;

        if self.mempool.get(tx.transaction_id)?.is_some() {
            return Err(ValidationError::DuplicateTransaction(tx.transaction_id).into());
        }
        self.validator
            .validate_transaction(&tx, self.ledger.as_ref())?;
        self.mempool.put(&tx)?;

        debug!(id = tx.transaction_id, "transaction admitted to mempool");
        Ok(tx)
    }

    /// Swap the local suffix for `segment` when it forms a valid chain off a
    /// locally held block and ends strictly higher than the local tip.
    ///
    /// `segment` must be sorted by index. Blocks identical to those already
    /// held are kept; the write starts at the first divergent block.
    pub async fn replace_chain(&self, segment: &[Block]) -> Result<Replacement> {
        let (first, last) = match (segment.first(), segment.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(ChainError::Consistency("empty replacement segment".to_string())),
        };
        if first.index == 0 {
            return Err(ChainError::Consistency(
                "genesis cannot be replaced".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;

        let tip = self.tip()?;
        if last.index <= tip.index {
            return Err(ChainError::StaleChain {
                candidate_tip: last.index,
                local_tip: tip.index,
            });
        }

        let anchor = self.ledger.by_index(first.index - 1)?.ok_or(
            ValidationError::InvalidIndex {
                expected: tip.index + 1,
                actual: first.index,
            },
        )?;

        let committed: HashSet<u64> = self
            .ledger
            .all()?
            .iter()
            .take_while(|b| b.index < first.index)
            .flat_map(|b| b.transaction_ids())
            .collect();
        self.validator.validate_segment(&anchor, segment, committed)?;

        let mut divergence = 0;
        for block in segment {
            match self.ledger.by_index(block.index)? {
                Some(held) if held.hash == block.hash => divergence += 1,
                _ => break,
            }
        }
        let adopted = segment[divergence..].to_vec();
        let from_index = adopted.first().map(|b| b.index).unwrap_or(last.index + 1);

        let dropped = self.ledger.replace_from(from_index, &adopted)?;

        let adopted_ids: HashSet<u64> = adopted.iter().flat_map(|b| b.transaction_ids()).collect();
        let mut restored = Vec::new();
        for tx in dropped.iter().flat_map(|b| b.transactions.iter()) {
            if adopted_ids.contains(&tx.transaction_id) {
                continue;
            }
            match self.mempool.put(tx) {
                Ok(()) => restored.push(tx.transaction_id),
                Err(e) => warn!(id = tx.transaction_id, error = %e, "failed to restore transaction"),
            }
        }
        self.evict(adopted_ids.into_iter());

        info!(
            from = from_index,
            dropped = dropped.len(),
            adopted = adopted.len(),
            restored = restored.len(),
            new_tip = last.index,
            "chain replaced"
        );
        Ok(Replacement {
            dropped,
            adopted,
            restored,
        })
    }

    /// Remove committed ids from the mempool. The commit already happened, so
    /// a store failure here is only logged.
    fn evict(&self, ids: impl Iterator<Item = u64>) {
        for id in ids {
            if let Err(e) = self.mempool.remove(id) {
                warn!(id, error = %e, "failed to evict committed transaction from mempool");
            }
        }
    }

    pub fn tip(&self) -> Result<Block> {
        self.ledger
            .tip()?
            .ok_or_else(|| ChainError::Consistency("ledger has no genesis block".to_string()))
    }

    pub fn chain(&self) -> Result<Vec<Block>> {
        self.ledger.all()
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Block> {
        self.ledger
            .by_hash(hash)?
            .ok_or_else(|| ChainError::NotFound(format!("block {}", hash)))
    }

    pub fn block_by_index(&self, index: u64) -> Result<Block> {
        self.ledger
            .by_index(index)?
            .ok_or_else(|| ChainError::NotFound(format!("block at index {}", index)))
    }

    pub fn mempool(&self) -> Result<Vec<Transaction>> {
        self.mempool.all()
    }

    /// Look in the mempool first, then in the committed chain.
    pub fn transaction(&self, transaction_id: u64) -> Result<Transaction> {
        if let Some(tx) = self.mempool.get(transaction_id)? {
            return Ok(tx);
        }
        self.find_transaction_block(transaction_id)?
            .transactions
            .into_iter()
            .find(|tx| tx.transaction_id == transaction_id)
            .ok_or_else(|| ChainError::NotFound(format!("transaction {}", transaction_id)))
    }

    pub fn find_transaction_block(&self, transaction_id: u64) -> Result<Block> {
        self.ledger
            .find_transaction(transaction_id)?
            .ok_or_else(|| ChainError::NotFound(format!("transaction {}", transaction_id)))
    }

    pub fn is_committed(&self, transaction_id: u64) -> Result<bool> {
        Ok(self.ledger.find_transaction(transaction_id)?.is_some())
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }
}
