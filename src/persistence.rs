//! Storage abstractions for the ledger, the mempool and the peer set.
//!
//! Two backends implement every trait: [`SqliteStore`] (rusqlite) for
//! durable nodes and [`InMemoryStore`] for tests and ephemeral runs.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::blockchain::Block;
use crate::error::Result;
use crate::peers::Peer;
use crate::transaction::Transaction;
use std::sync::Arc;

/// Committed blocks keyed by index and hash.
pub trait LedgerStore: Send + Sync {
    /// Store `block` at its index. Fails with a consistency error when a
    /// block already occupies that index.
    fn append(&self, block: &Block) -> Result<()>;

    fn by_hash(&self, hash: &str) -> Result<Option<Block>>;

    fn by_index(&self, index: u64) -> Result<Option<Block>>;

    /// The block with the highest index.
    fn tip(&self) -> Result<Option<Block>>;

    /// Every block, index ascending.
    fn all(&self) -> Result<Vec<Block>>;

    /// Atomically drop every block at or above `from_index` and store
    /// `blocks` in their place. Returns the dropped blocks.
    fn replace_from(&self, from_index: u64, blocks: &[Block]) -> Result<Vec<Block>>;

    /// The committed block containing `transaction_id`.
    fn find_transaction(&self, transaction_id: u64) -> Result<Option<Block>>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.tip()?.is_none())
    }
}

/// Unconfirmed transactions keyed by transaction id.
pub trait MempoolStore: Send + Sync {
    /// Insert or overwrite.
    fn put(&self, tx: &Transaction) -> Result<()>;

    fn remove(&self, transaction_id: u64) -> Result<Option<Transaction>>;

    fn get(&self, transaction_id: u64) -> Result<Option<Transaction>>;

    /// Every pending transaction in arrival order.
    fn all(&self) -> Result<Vec<Transaction>>;

    fn len(&self) -> Result<usize> {
        Ok(self.all()?.len())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Known peers keyed by url.
pub trait PeerStore: Send + Sync {
    /// Returns `true` when the peer was not known before.
    fn save(&self, peer: &Peer) -> Result<bool>;

    fn find_by_url(&self, url: &str) -> Result<Option<Peer>>;

    fn all(&self) -> Result<Vec<Peer>>;
}

/// The three stores a node runs on.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub mempool: Arc<dyn MempoolStore>,
    pub peers: Arc<dyn PeerStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self::from_backend(Arc::new(InMemoryStore::new()))
    }

    /// Open `path` with sqlite, or an in-memory store for `":memory:"`.
    pub fn open(path: &str) -> Result<Self> {
        if path == ":memory:" {
            return Ok(Self::in_memory());
        }
        Ok(Self::from_backend(Arc::new(SqliteStore::open(path)?)))
    }

    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: LedgerStore + MempoolStore + PeerStore + 'static,
    {
        Self {
            ledger: backend.clone(),
            mempool: backend.clone(),
            peers: backend,
        }
    }
}
