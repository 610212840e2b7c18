//! Admission rules for blocks and transactions.
//!
//! Rules are checked in a fixed order and the first failure is reported;
//! nothing here touches storage beyond the read-only [`ChainView`].

use super::block::Block;
use crate::error::{Result, ValidationError};
use crate::transaction::{ChainView, Transaction};
use std::collections::HashSet;
use std::sync::Arc;

/// Proof-of-work hook. A candidate passes when its measure is strictly
/// smaller than the difficulty required at its index.
pub trait DifficultyPolicy: Send + Sync {
    fn current_difficulty(&self, index: u64) -> i64;
    fn difficulty_measure(&self, block: &Block) -> i64;
}

/// Difficulty 0 against a fixed measure of -1: every block passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrivialDifficulty;

impl DifficultyPolicy for TrivialDifficulty {
    fn current_difficulty(&self, _index: u64) -> i64 {
        0
    }

    fn difficulty_measure(&self, _block: &Block) -> i64 {
        -1
    }
}

#[derive(Clone)]
pub struct Validator {
    difficulty: Arc<dyn DifficultyPolicy>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::with_difficulty(Arc::new(TrivialDifficulty))
    }

    pub fn with_difficulty(difficulty: Arc<dyn DifficultyPolicy>) -> Self {
        Self { difficulty }
    }

    /// Check `candidate` as the successor of `previous`.
    ///
    /// `chain` is the chain as it stood before the candidate; it is only
    /// consulted for transaction uniqueness.
    pub fn validate_block<C>(&self, candidate: &Block, previous: &Block, chain: &C) -> Result<()>
    where
        C: ChainView + ?Sized,
    {
        if candidate.index != previous.index + 1 {
            return Err(ValidationError::InvalidIndex {
                expected: previous.index + 1,
                actual: candidate.index,
            }
            .into());
        }

        if candidate.previous_hash != previous.hash {
            return Err(ValidationError::InvalidPreviousHash {
                expected: previous.hash.clone(),
                actual: candidate.previous_hash.clone(),
            }
            .into());
        }

        let expected_hash = candidate.calculate_hash();
        if expected_hash != candidate.hash {
            return Err(ValidationError::InvalidHash {
                expected: expected_hash,
                actual: candidate.hash.clone(),
            }
            .into());
        }

        let measure = self.difficulty.difficulty_measure(candidate);
        let difficulty = self.difficulty.current_difficulty(candidate.index);
        if measure >= difficulty {
            return Err(ValidationError::InvalidDifficulty { measure, difficulty }.into());
        }

        let mut seen = HashSet::with_capacity(candidate.transactions.len());
        for tx in &candidate.transactions {
            if !seen.insert(tx.transaction_id) {
                return Err(ValidationError::DuplicateTransaction(tx.transaction_id).into());
            }
            self.validate_transaction(tx, chain)?;
        }

        Ok(())
    }

    /// Fails with `DuplicateTransaction` when `chain` already commits the id.
    pub fn validate_transaction<C>(&self, tx: &Transaction, chain: &C) -> Result<()>
    where
        C: ChainView + ?Sized,
    {
        tx.check()?;
        if chain.contains_transaction(tx.transaction_id)? {
            return Err(ValidationError::DuplicateTransaction(tx.transaction_id).into());
        }
        Ok(())
    }

    /// Validate `segment` as a contiguous chain hanging off `anchor`.
    ///
    /// `committed` holds the transaction ids committed up to and including
    /// the anchor; it is extended block by block as the segment is walked.
    pub fn validate_segment(
        &self,
        anchor: &Block,
        segment: &[Block],
        mut committed: HashSet<u64>,
    ) -> Result<()> {
        let mut previous = anchor;
        for block in segment {
            self.validate_block(block, previous, &committed)?;
            committed.extend(block.transaction_ids());
            previous = block;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChainError;

    fn tx(id: u64) -> Transaction {
        Transaction::transfer(id, "alice", "bob", "deed", "sig")
    }

    fn no_history() -> HashSet<u64> {
        HashSet::new()
    }

    #[test]
    fn test_valid_successor() {
        let genesis = Block::genesis();
        let block = Block::new(1, genesis.hash.clone(), vec![tx(1), tx(2)]);
        assert!(Validator::new()
            .validate_block(&block, &genesis, &no_history())
            .is_ok());
    }

    #[test]
    fn test_index_checked_first() {
        let genesis = Block::genesis();
        // Both index and previous hash are wrong; index wins.
        let block = Block::new(5, "bogus".to_string(), Vec::new());
        match Validator::new().validate_block(&block, &genesis, &no_history()) {
            Err(ChainError::Validation(ValidationError::InvalidIndex { expected, actual })) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 5);
            }
            other => panic!("expected InvalidIndex, got {:?}", other),
        }
    }

    #[test]
    fn test_previous_hash_mismatch() {
        let genesis = Block::genesis();
        let block = Block::new(1, "bogus".to_string(), Vec::new());
        assert!(matches!(
            Validator::new().validate_block(&block, &genesis, &no_history()),
            Err(ChainError::Validation(ValidationError::InvalidPreviousHash { .. }))
        ));
    }

    #[test]
    fn test_tampered_hash() {
        let genesis = Block::genesis();
        let mut block = Block::new(1, genesis.hash.clone(), vec![tx(1)]);
        block.transactions.push(tx(2));
        assert!(matches!(
            Validator::new().validate_block(&block, &genesis, &no_history()),
            Err(ChainError::Validation(ValidationError::InvalidHash { .. }))
        ));
    }

    #[test]
    fn test_difficulty_policy_is_pluggable() {
        struct Impossible;
        impl DifficultyPolicy for Impossible {
            fn current_difficulty(&self, _index: u64) -> i64 {
                i64::MIN
            }
            fn difficulty_measure(&self, _block: &Block) -> i64 {
                0
            }
        }

        let genesis = Block::genesis();
        let block = Block::new(1, genesis.hash.clone(), Vec::new());
        let validator = Validator::with_difficulty(Arc::new(Impossible));
        assert!(matches!(
            validator.validate_block(&block, &genesis, &no_history()),
            Err(ChainError::Validation(ValidationError::InvalidDifficulty { .. }))
        ));
    }

    #[test]
    fn test_committed_transaction_is_duplicate() {
        let genesis = Block::genesis();
        let block = Block::new(1, genesis.hash.clone(), vec![tx(9)]);
        let history: HashSet<u64> = [9].into_iter().collect();
        assert!(matches!(
            Validator::new().validate_block(&block, &genesis, &history),
            Err(ChainError::Validation(ValidationError::DuplicateTransaction(9)))
        ));
    }

    #[test]
    fn test_repeated_id_inside_block_is_duplicate() {
        let genesis = Block::genesis();
        let block = Block::new(1, genesis.hash.clone(), vec![tx(3), tx(3)]);
        assert!(matches!(
            Validator::new().validate_block(&block, &genesis, &no_history()),
            Err(ChainError::Validation(ValidationError::DuplicateTransaction(3)))
        ));
    }

    #[test]
    fn test_segment_validation() {
        let genesis = Block::genesis();
        let a = Block::new(1, genesis.hash.clone(), vec![tx(1)]);
        let b = Block::new(2, a.hash.clone(), vec![tx(2)]);
        let validator = Validator::new();
        assert!(validator
            .validate_segment(&genesis, &[a.clone(), b], no_history())
            .is_ok());

        // A later block re-committing an id from an earlier block of the segment.
        let replay = Block::new(2, a.hash.clone(), vec![tx(1)]);
        assert!(matches!(
            validator.validate_segment(&genesis, &[a, replay], no_history()),
            Err(ChainError::Validation(ValidationError::DuplicateTransaction(1)))
        ));
    }
}
