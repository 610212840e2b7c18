//! Outbound peer calls.
//!
//! [`PeerClient`] is the seam between replication logic and the wire. The
//! HTTP client talks to the routes served by `api`; the loopback client
//! routes calls to nodes living in the same process.

pub mod http;
pub mod loopback;

pub use http::HttpPeerClient;
pub use loopback::{LoopbackClient, LoopbackNetwork};

use crate::blockchain::Block;
use crate::error::NetworkError;
use crate::peers::Peer;
use crate::transaction::Transaction;
use async_trait::async_trait;

/// Header carrying the sender's own url on every peer request.
pub const ORIGIN_HEADER: &str = "x-peer-origin";

pub type NetResult<T> = std::result::Result<T, NetworkError>;

/// Calls a node makes on a remote peer, addressed by the peer's url.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Announce `me` to `peer`.
    async fn send_peer(&self, peer: &str, me: &Peer) -> NetResult<()>;

    async fn last_block(&self, peer: &str) -> NetResult<Block>;

    /// The peer's full chain, index ascending.
    async fn blocks(&self, peer: &str) -> NetResult<Vec<Block>>;

    /// Offer `block` to the peer's reconciliation.
    async fn put_block(&self, peer: &str, block: &Block) -> NetResult<()>;

    async fn post_transaction(&self, peer: &str, tx: &Transaction) -> NetResult<()>;

    /// The peer's mempool.
    async fn transactions(&self, peer: &str) -> NetResult<Vec<Transaction>>;

    /// Whether the peer holds `transaction_id` in a committed block.
    async fn has_transaction(&self, peer: &str, transaction_id: u64) -> NetResult<bool>;
}
