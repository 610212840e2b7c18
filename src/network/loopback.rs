//! In-process transport: peer calls are routed straight to [`Node`]s
//! registered on a shared [`LoopbackNetwork`]. Unregistered or dropped
//! nodes behave like unreachable hosts.

use super::{NetResult, PeerClient};
use crate::blockchain::Block;
use crate::config::Config;
use crate::error::{ChainError, NetworkError};
use crate::node::Node;
use crate::peers::{normalize_url, Peer};
use crate::persistence::Stores;
use crate::transaction::Transaction;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    nodes: Arc<RwLock<HashMap<String, Weak<Node>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an in-memory node for `config` wired to this network and
    /// register it under its self url. The node still needs `start`.
    pub fn spawn_node(&self, config: Config) -> Arc<Node> {
        let client = Arc::new(self.client(&config.node.self_url));
        let node = Node::new(config, Stores::in_memory(), client);
        self.register(&node);
        node
    }

    pub fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .insert(normalize_url(node.self_url()), Arc::downgrade(node));
    }

    /// Take `url` off the network; calls to it fail as unreachable.
    pub fn disconnect(&self, url: &str) {
        self.nodes.write().remove(&normalize_url(url));
    }

    /// A client whose calls carry `origin` as the sender.
    pub fn client(&self, origin: &str) -> LoopbackClient {
        LoopbackClient {
            network: self.clone(),
            origin: normalize_url(origin),
        }
    }

    fn resolve(&self, url: &str) -> NetResult<Arc<Node>> {
        self.nodes
            .read()
            .get(&normalize_url(url))
            .and_then(Weak::upgrade)
            .ok_or_else(|| NetworkError::Unreachable {
                url: url.to_string(),
                reason: "no node registered at this url".to_string(),
            })
    }
}

pub struct LoopbackClient {
    network: LoopbackNetwork,
    origin: String,
}

/// Render a remote node failure the way an HTTP peer would report it.
fn remote_error(peer: &str, err: ChainError) -> NetworkError {
    NetworkError::Status {
        url: peer.to_string(),
        status: err.status_code(),
    }
}

#[async_trait]
impl PeerClient for LoopbackClient {
    async fn send_peer(&self, peer: &str, me: &Peer) -> NetResult<()> {
        let node = self.network.resolve(peer)?;
        node.accept_peer(&me.url)
            .map(|_| ())
            .map_err(|e| remote_error(peer, e))
    }

    async fn last_block(&self, peer: &str) -> NetResult<Block> {
        let node = self.network.resolve(peer)?;
        node.get_last_block().map_err(|e| remote_error(peer, e))
    }

    async fn blocks(&self, peer: &str) -> NetResult<Vec<Block>> {
        let node = self.network.resolve(peer)?;
        node.get_chain().map_err(|e| remote_error(peer, e))
    }

    async fn put_block(&self, peer: &str, block: &Block) -> NetResult<()> {
        let node = self.network.resolve(peer)?;
        node.receive_blocks(vec![block.clone()], Some(self.origin.as_str()))
            .await;
        Ok(())
    }

    async fn post_transaction(&self, peer: &str, tx: &Transaction) -> NetResult<()> {
        let node = self.network.resolve(peer)?;
        node.submit_transaction(tx.clone(), true, Some(self.origin.as_str()))
            .await
            .map(|_| ())
            .map_err(|e| remote_error(peer, e))
    }

    async fn transactions(&self, peer: &str) -> NetResult<Vec<Transaction>> {
        let node = self.network.resolve(peer)?;
        node.get_mempool().map_err(|e| remote_error(peer, e))
    }

    async fn has_transaction(&self, peer: &str, transaction_id: u64) -> NetResult<bool> {
        let node = self.network.resolve(peer)?;
        match node.find_transaction_block(transaction_id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(remote_error(peer, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unregistered_url_is_unreachable() {
        let network = LoopbackNetwork::new();
        let client = network.client("http://a:1");
        assert!(matches!(
            client.last_block("http://nobody:1").await,
            Err(NetworkError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_calls_reach_registered_node() {
        let network = LoopbackNetwork::new();
        let node = network.spawn_node(Config::ephemeral("http://b:1"));
        node.start().await.unwrap();

        let client = network.client("http://a:1");
        assert_eq!(client.last_block("http://b:1/").await.unwrap(), Block::genesis());
        assert!(!client.has_transaction("http://b:1", 9).await.unwrap());

        let tx = Transaction::transfer(9, "a", "b", "c", "s");
        client.post_transaction("http://b:1", &tx).await.unwrap();
        assert!(matches!(
            client.post_transaction("http://b:1", &tx).await,
            Err(NetworkError::Status { status: 409, .. })
        ));
        assert_eq!(client.transactions("http://b:1").await.unwrap().len(), 1);

        network.disconnect("http://b:1");
        assert!(client.blocks("http://b:1").await.is_err());
    }
}
