use crate::blockchain::{Block, Blockchain, Validator};
use crate::config::Config;
use crate::consensus::{ConsensusCoordinator, Reconciliation};
use crate::error::Result;
use crate::events::{EventBus, EventHandler, EventKind, NodeEvent};
use crate::miner::Miner;
use crate::network::{HttpPeerClient, PeerClient};
use crate::peers::{Peer, PeerRegistry};
use crate::persistence::Stores;
use crate::transaction::Transaction;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Booting,
    Ready,
}

/// The façade every request goes through.
///
/// Local mutations are published on the event bus; replication handlers
/// subscribed by [`Node::start`] fan them out to peers.
pub struct Node {
    config: Config,
    state: RwLock<NodeState>,
    chain: Arc<Blockchain>,
    registry: Arc<PeerRegistry>,
    consensus: Arc<ConsensusCoordinator>,
    miner: Miner,
    bus: EventBus,
}

impl Node {
    pub fn new(config: Config, stores: Stores, client: Arc<dyn PeerClient>) -> Arc<Self> {
        Self::with_validator(config, stores, client, Validator::new())
    }

    pub fn with_validator(
        config: Config,
        stores: Stores,
        client: Arc<dyn PeerClient>,
        validator: Validator,
    ) -> Arc<Self> {
        let chain = Arc::new(Blockchain::new(stores.ledger, stores.mempool, validator));
        let registry = Arc::new(PeerRegistry::new(
            Peer::new(config.node.self_url.as_str()),
            stores.peers,
            client,
            config.peer_timeout(),
        ));
        let bus = EventBus::new();
        let consensus = Arc::new(ConsensusCoordinator::new(
            chain.clone(),
            registry.clone(),
            bus.clone(),
            config.network.chain_fetch_attempts,
        ));

        Arc::new(Self {
            miner: Miner::new(chain.clone()),
            state: RwLock::new(NodeState::Booting),
            config,
            chain,
            registry,
            consensus,
            bus,
        })
    }

    /// A node with the store named by `database.path` talking HTTP to peers.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let stores = Stores::open(&config.database.path)?;
        let client = Arc::new(HttpPeerClient::new(
            &config.node.self_url,
            config.peer_timeout(),
        )?);
        Ok(Self::new(config, stores, client))
    }

    /// Seed or load the ledger, subscribe replication and turn Ready.
    /// Bootstrap handshakes continue in the background.
    ///
    /// A ledger that cannot be initialised is fatal. Calling `start` again
    /// is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() == NodeState::Ready {
            return Ok(());
        }

        let tip = self.chain.init().await?;
        self.subscribe_replication();
        *self.state.write() = NodeState::Ready;
        info!(
            self_url = %self.self_url(),
            height = tip.index,
            "node ready"
        );

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.bootstrap().await;
        });
        Ok(())
    }

    /// Handshake with every configured bootstrap peer, then ask all peers
    /// for their tips.
    pub async fn bootstrap(&self) {
        for url in &self.config.network.bootstrap_peers {
            if let Err(e) = self.add_peer(url).await {
                warn!(peer = %url, error = %e, "bootstrap handshake failed");
            }
        }
        self.request_sync();
    }

    fn subscribe_replication(&self) {
        self.bus.subscribe(
            EventKind::BlockAdded,
            Arc::new(BlockReplicator {
                registry: self.registry.clone(),
            }),
        );
        self.bus.subscribe(
            EventKind::TransactionAdded,
            Arc::new(TransactionReplicator {
                registry: self.registry.clone(),
            }),
        );
        self.bus.subscribe(
            EventKind::GetBlocks,
            Arc::new(TipSync {
                registry: self.registry.clone(),
                consensus: Arc::downgrade(&self.consensus),
            }),
        );
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn self_url(&self) -> &str {
        &self.registry.me().url
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn get_chain(&self) -> Result<Vec<Block>> {
        self.chain.chain()
    }

    pub fn get_block(&self, hash: &str) -> Result<Block> {
        self.chain.block_by_hash(hash)
    }

    pub fn get_block_by_index(&self, index: u64) -> Result<Block> {
        self.chain.block_by_index(index)
    }

    pub fn get_last_block(&self) -> Result<Block> {
        self.chain.tip()
    }

    pub fn get_mempool(&self) -> Result<Vec<Transaction>> {
        self.chain.mempool()
    }

    pub fn get_transaction(&self, transaction_id: u64) -> Result<Transaction> {
        self.chain.transaction(transaction_id)
    }

    pub fn find_transaction_block(&self, transaction_id: u64) -> Result<Block> {
        self.chain.find_transaction_block(transaction_id)
    }

    pub async fn add_transaction(&self, tx: Transaction, broadcast: bool) -> Result<Transaction> {
        self.submit_transaction(tx, broadcast, None).await
    }

    /// [`Node::add_transaction`] for a transaction relayed by `origin`.
    pub async fn submit_transaction(
        &self,
        tx: Transaction,
        broadcast: bool,
        origin: Option<&str>,
    ) -> Result<Transaction> {
        let tx = self.chain.add_transaction(tx).await?;
        if broadcast {
            self.bus.publish(NodeEvent::transaction_added(
                tx.clone(),
                origin.map(str::to_string),
            ));
        }
        Ok(tx)
    }

    pub async fn add_block(&self, block: Block, broadcast: bool) -> Result<Block> {
        self.submit_block(block, broadcast, None).await
    }

    pub async fn submit_block(
        &self,
        block: Block,
        broadcast: bool,
        origin: Option<&str>,
    ) -> Result<Block> {
        let block = self.chain.add_block(block).await?;
        if broadcast {
            self.bus
                .publish(NodeEvent::block_added(block.clone(), origin.map(str::to_string)));
        }
        Ok(block)
    }

    /// Blocks offered by a peer go through reconciliation, never straight
    /// to the ledger.
    pub async fn receive_blocks(&self, blocks: Vec<Block>, origin: Option<&str>) -> Reconciliation {
        let outcome = self.consensus.reconcile(blocks, origin).await;
        debug!(peer = ?origin, ?outcome, "received blocks reconciled");
        outcome
    }

    /// Assemble a candidate block. Nothing is committed.
    pub fn mine(&self, address: &str) -> Result<Block> {
        self.miner.mine(address)
    }

    /// Mine a block and commit it, broadcasting on success.
    pub async fn mine_and_commit(&self, address: &str) -> Result<Block> {
        let block = self.mine(address)?;
        self.add_block(block, true).await
    }

    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        self.registry.peers()
    }

    /// Handshake with `url` and wait for it to finish.
    pub async fn add_peer(&self, url: &str) -> Result<Peer> {
        self.registry.handshake(url, &self.consensus).await
    }

    /// Accept a peer announcement: the url is checked now and the handshake
    /// runs in the background.
    pub fn accept_peer(self: &Arc<Self>, url: &str) -> Result<Peer> {
        let peer = Peer::parse(url)?;
        if self.registry.is_self(&peer.url) {
            return Ok(peer);
        }

        let node = Arc::clone(self);
        let url = peer.url.clone();
        tokio::spawn(async move {
            if let Err(e) = node.add_peer(&url).await {
                warn!(peer = %url, error = %e, "handshake with announced peer failed");
            }
        });
        Ok(peer)
    }

    /// One for this node if the transaction is committed here, plus one for
    /// every peer reporting it committed.
    pub async fn count_confirmations(&self, transaction_id: u64) -> Result<u64> {
        let local = u64::from(self.chain.is_committed(transaction_id)?);
        let remote = self
            .registry
            .count_remote_confirmations(transaction_id)
            .await?;
        Ok(local + remote)
    }

    /// Ask every peer for its tip and reconcile the answers.
    pub fn request_sync(&self) {
        self.bus.publish(NodeEvent::GetBlocks);
    }
}

struct BlockReplicator {
    registry: Arc<PeerRegistry>,
}

#[async_trait]
impl EventHandler for BlockReplicator {
    async fn handle(&self, event: NodeEvent) {
        if let NodeEvent::BlockAdded { block, origin } = event {
            if let Err(e) = self.registry.broadcast_block(&block, origin.as_deref()).await {
                warn!(index = block.index, error = %e, "block broadcast failed");
            }
        }
    }
}

struct TransactionReplicator {
    registry: Arc<PeerRegistry>,
}

#[async_trait]
impl EventHandler for TransactionReplicator {
    async fn handle(&self, event: NodeEvent) {
        if let NodeEvent::TransactionAdded {
            transaction,
            origin,
        } = event
        {
            if let Err(e) = self
                .registry
                .broadcast_transaction(&transaction, origin.as_deref())
                .await
            {
                warn!(id = transaction.transaction_id, error = %e, "transaction broadcast failed");
            }
        }
    }
}

struct TipSync {
    registry: Arc<PeerRegistry>,
    // Weak: the coordinator owns the bus this handler is subscribed to.
    consensus: Weak<ConsensusCoordinator>,
}

#[async_trait]
impl EventHandler for TipSync {
    async fn handle(&self, _event: NodeEvent) {
        let Some(consensus) = self.consensus.upgrade() else {
            return;
        };
        let tips = match self.registry.fetch_tips().await {
            Ok(tips) => tips,
            Err(e) => {
                warn!(error = %e, "tip sync failed");
                return;
            }
        };
        for (peer, tip) in tips {
            let outcome = consensus.reconcile(vec![tip], Some(&peer)).await;
            debug!(peer = %peer, ?outcome, "tip sync");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackNetwork;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn started(url: &str) -> Arc<Node> {
        let network = LoopbackNetwork::new();
        let node = network.spawn_node(Config::ephemeral(url));
        node.start().await.unwrap();
        node
    }

    #[tokio::test]
    async fn test_start_seeds_genesis_and_turns_ready() {
        timeout(Duration::from_secs(5), async {
            let network = LoopbackNetwork::new();
            let node = network.spawn_node(Config::ephemeral("http://solo:1"));
            assert_eq!(node.state(), NodeState::Booting);
            node.start().await.unwrap();
            node.start().await.unwrap();
            assert_eq!(node.state(), NodeState::Ready);
            assert_eq!(node.get_chain().unwrap(), vec![Block::genesis()]);
            assert_eq!(node.events().subscriber_count(), 3);
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_lookups_report_not_found() {
        let node = started("http://solo:1").await;
        assert!(node.get_block("nope").unwrap_err().is_not_found());
        assert!(node.get_block_by_index(3).unwrap_err().is_not_found());
        assert!(node.get_transaction(3).unwrap_err().is_not_found());
        assert!(node.find_transaction_block(3).unwrap_err().is_not_found());
        assert_eq!(node.get_block_by_index(0).unwrap(), Block::genesis());
    }

    #[tokio::test]
    async fn test_mine_does_not_commit() {
        let node = started("http://solo:1").await;
        let block = node.mine("addr").unwrap();
        assert_eq!(node.get_chain().unwrap().len(), 1);

        node.add_block(block.clone(), false).await.unwrap();
        assert_eq!(node.get_last_block().unwrap(), block);

        let committed = node.mine_and_commit("addr").await.unwrap();
        assert_eq!(committed.index, 2);
    }

    #[tokio::test]
    async fn test_confirmations_without_peers() {
        let node = started("http://solo:1").await;
        let tx = Transaction::transfer(5, "a", "b", "c", "s");
        node.add_transaction(tx.clone(), true).await.unwrap();
        assert_eq!(node.count_confirmations(5).await.unwrap(), 0);

        node.mine_and_commit("addr").await.unwrap();
        assert_eq!(node.count_confirmations(5).await.unwrap(), 1);
        assert_eq!(node.find_transaction_block(5).unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_handshake_with_self_is_a_noop() {
        let node = started("http://solo:1").await;
        let peer = node.add_peer("http://solo:1/").await.unwrap();
        assert_eq!(peer.url, "http://solo:1");
        assert!(node.list_peers().unwrap().is_empty());
        assert!(node.accept_peer("http://solo:1").is_ok());
        assert!(node.list_peers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_peer_url_is_refused() {
        let node = started("http://solo:1").await;
        assert!(matches!(
            node.add_peer("not-a-url").await,
            Err(crate::error::ChainError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_peer_never_fails_local_writes() {
        timeout(Duration::from_secs(10), async {
            let node = started("http://solo:1").await;
            // Registered but nobody answers at that url.
            node.add_peer("http://ghost:1").await.unwrap();
            assert_eq!(node.list_peers().unwrap(), vec![Peer::new("http://ghost:1")]);

            let tx = Transaction::transfer(1, "a", "b", "c", "s");
            node.add_transaction(tx, true).await.unwrap();
            let block = node.mine("addr").unwrap();
            node.add_block(block, true).await.unwrap();
            assert_eq!(node.get_chain().unwrap().len(), 2);
        })
        .await
        .unwrap();
    }
}
