//! Volatile backend. Every table lives behind its own `parking_lot::RwLock`.

use super::{LedgerStore, MempoolStore, PeerStore};
use crate::blockchain::Block;
use crate::error::{ChainError, Result};
use crate::peers::Peer;
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct ChainTables {
    blocks: BTreeMap<u64, Block>,
    by_hash: HashMap<String, u64>,
    by_transaction: HashMap<u64, u64>,
}

impl ChainTables {
    fn insert(&mut self, block: &Block) {
        self.by_hash.insert(block.hash.clone(), block.index);
        for id in block.transaction_ids() {
            self.by_transaction.insert(id, block.index);
        }
        self.blocks.insert(block.index, block.clone());
    }

    fn remove_from(&mut self, from_index: u64) -> Vec<Block> {
        let removed: Vec<Block> = self.blocks.split_off(&from_index).into_values().collect();
        for block in &removed {
            self.by_hash.remove(&block.hash);
            for id in block.transaction_ids() {
                self.by_transaction.remove(&id);
            }
        }
        removed
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    chain: RwLock<ChainTables>,
    mempool: RwLock<Vec<Transaction>>,
    peers: RwLock<Vec<Peer>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for InMemoryStore {
    fn append(&self, block: &Block) -> Result<()> {
        let mut chain = self.chain.write();
        if chain.blocks.contains_key(&block.index) {
            return Err(ChainError::Consistency(format!(
                "block index {} already stored",
                block.index
            )));
        }
        chain.insert(block);
        Ok(())
    }

    fn by_hash(&self, hash: &str) -> Result<Option<Block>> {
        let chain = self.chain.read();
        Ok(chain
            .by_hash
            .get(hash)
            .and_then(|index| chain.blocks.get(index))
            .cloned())
    }

    fn by_index(&self, index: u64) -> Result<Option<Block>> {
        Ok(self.chain.read().blocks.get(&index).cloned())
    }

    fn tip(&self) -> Result<Option<Block>> {
        Ok(self
            .chain
            .read()
            .blocks
            .last_key_value()
            .map(|(_, block)| block.clone()))
    }

    fn all(&self) -> Result<Vec<Block>> {
        Ok(self.chain.read().blocks.values().cloned().collect())
    }

    fn replace_from(&self, from_index: u64, blocks: &[Block]) -> Result<Vec<Block>> {
        let mut chain = self.chain.write();
        let removed = chain.remove_from(from_index);
        for block in blocks {
            chain.insert(block);
        }
        Ok(removed)
    }

    fn find_transaction(&self, transaction_id: u64) -> Result<Option<Block>> {
        let chain = self.chain.read();
        Ok(chain
            .by_transaction
            .get(&transaction_id)
            .and_then(|index| chain.blocks.get(index))
            .cloned())
    }
}

impl MempoolStore for InMemoryStore {
    fn put(&self, tx: &Transaction) -> Result<()> {
        let mut pool = self.mempool.write();
        match pool
            .iter_mut()
            .find(|pending| pending.transaction_id == tx.transaction_id)
        {
            Some(slot) => *slot = tx.clone(),
            None => pool.push(tx.clone()),
        }
        Ok(())
    }

    fn remove(&self, transaction_id: u64) -> Result<Option<Transaction>> {
        let mut pool = self.mempool.write();
        Ok(pool
            .iter()
            .position(|tx| tx.transaction_id == transaction_id)
            .map(|pos| pool.remove(pos)))
    }

    fn get(&self, transaction_id: u64) -> Result<Option<Transaction>> {
        Ok(self
            .mempool
            .read()
            .iter()
            .find(|tx| tx.transaction_id == transaction_id)
            .cloned())
    }

    fn all(&self) -> Result<Vec<Transaction>> {
        Ok(self.mempool.read().clone())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.mempool.read().len())
    }
}

impl PeerStore for InMemoryStore {
    fn save(&self, peer: &Peer) -> Result<bool> {
        let mut peers = self.peers.write();
        if peers.iter().any(|known| known.url == peer.url) {
            return Ok(false);
        }
        peers.push(peer.clone());
        Ok(true)
    }

    fn find_by_url(&self, url: &str) -> Result<Option<Peer>> {
        Ok(self.peers.read().iter().find(|p| p.url == url).cloned())
    }

    fn all(&self) -> Result<Vec<Peer>> {
        Ok(self.peers.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::{exercise_ledger, exercise_mempool, exercise_peers};

    #[test]
    fn test_ledger() {
        exercise_ledger(&InMemoryStore::new());
    }

    #[test]
    fn test_mempool() {
        exercise_mempool(&InMemoryStore::new());
    }

    #[test]
    fn test_peers() {
        exercise_peers(&InMemoryStore::new());
    }
}
