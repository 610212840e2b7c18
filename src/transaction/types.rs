/// Transaction types for peerchain
use crate::crypto::sha256_hex;
use serde::{Deserialize, Serialize};

/// The party authorizing a transfer and what is being transferred.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Input {
    pub address: String,
    pub contract: String,
    #[serde(default)]
    pub signature: String,
}

/// A recipient of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Output {
    pub address: String,
    pub contract: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionData {
    pub input: Input,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// A transfer of a contract between addresses.
///
/// `transaction_id` is unique across the committed chain and the mempool;
/// `hash` is the digest over `(transaction_id, data)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub transaction_id: u64,
    #[serde(default)]
    pub hash: String,
    pub data: TransactionData,
}

impl Transaction {
    pub fn new(transaction_id: u64, data: TransactionData) -> Self {
        Transaction {
            transaction_id,
            hash: String::new(),
            data,
        }
        .with_hash()
    }

    /// Build a transaction with a randomly generated id.
    pub fn with_random_id(data: TransactionData) -> Self {
        Self::new(rand::random::<u64>(), data)
    }

    /// Convenience constructor for a single-output transfer.
    pub fn transfer(
        transaction_id: u64,
        from: &str,
        to: &str,
        contract: &str,
        signature: &str,
    ) -> Self {
        Self::new(
            transaction_id,
            TransactionData {
                input: Input {
                    address: from.to_string(),
                    contract: contract.to_string(),
                    signature: signature.to_string(),
                },
                outputs: vec![Output {
                    address: to.to_string(),
                    contract: contract.to_string(),
                }],
            },
        )
    }

    pub fn calculate_hash(&self) -> String {
        // Plain structs with string keys always serialize.
        let data = serde_json::to_string(&self.data).unwrap_or_default();
        sha256_hex(&format!("{}{}", self.transaction_id, data))
    }

    /// Recompute and store the hash.
    pub fn with_hash(mut self) -> Self {
        self.hash = self.calculate_hash();
        self
    }

    pub fn hash_matches(&self) -> bool {
        self.hash == self.calculate_hash()
    }
}
