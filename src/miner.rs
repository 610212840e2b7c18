//! Candidate block assembly. Mining never commits; callers submit the result
//! through the normal admission path.

use crate::blockchain::{Block, Blockchain};
use crate::error::Result;
use crate::transaction::{Input, Output, Transaction, TransactionData};
use std::sync::Arc;
use tracing::debug;

pub const DEMO_INPUT_CONTRACT: &str = "some contract";
pub const DEMO_OUTPUT_CONTRACT: &str = "some other contract";
const DEMO_SIGNATURE: &str = "signature";

pub struct Miner {
    chain: Arc<Blockchain>,
}

impl Miner {
    pub fn new(chain: Arc<Blockchain>) -> Self {
        Self { chain }
    }

    /// Build the successor of the current tip from the mempool. An empty
    /// mempool yields a block carrying one demonstration transaction
    /// addressed to `address`.
    pub fn mine(&self, address: &str) -> Result<Block> {
        let tip = self.chain.tip()?;
        let mut transactions = self.chain.mempool()?;
        if transactions.is_empty() {
            transactions.push(demo_transaction(address));
        }

        let block = Block::new(tip.index + 1, tip.hash, transactions);
        debug!(
            index = block.index,
            transactions = block.transactions.len(),
            miner = address,
            "candidate block assembled"
        );
        Ok(block)
    }
}

fn demo_transaction(address: &str) -> Transaction {
    Transaction::with_random_id(TransactionData {
        input: Input {
            address: address.to_string(),
            contract: DEMO_INPUT_CONTRACT.to_string(),
            signature: DEMO_SIGNATURE.to_string(),
        },
        outputs: vec![Output {
            address: address.to_string(),
            contract: DEMO_OUTPUT_CONTRACT.to_string(),
        }],
    })
}
