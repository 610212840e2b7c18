use crate::crypto::sha256_hex;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// `previous_hash` carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    /// Seconds since epoch at creation. Informational only.
    pub timestamp: i64,
    pub nonce: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block stamped with the current time and hash it.
    pub fn new(index: u64, previous_hash: String, transactions: Vec<Transaction>) -> Self {
        Self::with_timestamp(index, previous_hash, chrono::Utc::now().timestamp(), transactions)
    }

    pub fn with_timestamp(
        index: u64,
        previous_hash: String,
        timestamp: i64,
        transactions: Vec<Transaction>,
    ) -> Self {
        Block {
            index,
            previous_hash,
            timestamp,
            nonce: 0,
            hash: String::new(),
            transactions,
        }
        .with_hash()
    }

    /// The fixed first block of every chain.
    pub fn genesis() -> Self {
        Self::with_timestamp(0, GENESIS_PREVIOUS_HASH.to_string(), 0, Vec::new())
    }

    /// Digest over `(index, previous_hash, timestamp, transactions, nonce)`.
    pub fn calculate_hash(&self) -> String {
        // Plain structs with string keys always serialize.
        let transactions = serde_json::to_string(&self.transactions).unwrap_or_default();
        sha256_hex(&format!(
            "{}{}{}{}{}",
            self.index, self.previous_hash, self.timestamp, transactions, self.nonce
        ))
    }

    /// Recompute and store the hash.
    pub fn with_hash(mut self) -> Self {
        self.hash = self.calculate_hash();
        self
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::genesis()
    }

    /// Whether the block claims to start a chain.
    pub fn claims_genesis(&self) -> bool {
        self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Whether `self` directly extends `previous`.
    pub fn extends(&self, previous: &Block) -> bool {
        self.index == previous.index + 1 && self.previous_hash == previous.hash
    }

    pub fn contains_transaction(&self, transaction_id: u64) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.transaction_id == transaction_id)
    }

    pub fn transaction_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.transactions.iter().map(|tx| tx.transaction_id)
    }

    pub fn short_hash(&self) -> &str {
        self.hash.get(..12).unwrap_or(&self.hash)
    }
}
