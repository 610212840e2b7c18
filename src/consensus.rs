//! Reconciliation of blocks learned from peers against the local chain.
//!
//! Longest valid chain wins. A lone block either extends the tip (append) or
//! cannot be placed, in which case full chains are fetched once and
//! reconciled without any further fetching. A multi-block segment is
//! validated as a whole before anything is written; it is adopted entirely
//! or not at all.

use crate::blockchain::{Block, Blockchain, Replacement};
use crate::error::{ChainError, ValidationError};
use crate::events::{EventBus, NodeEvent};
use crate::peers::PeerRegistry;
use crate::transaction::Transaction;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Nothing left once genesis claims were dropped.
    NoCandidates,
    /// Highest candidate is not above the local tip.
    Stale,
}

/// Outcome of one reconciliation, with the reason when nothing changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Ignored(IgnoreReason),
    Appended(Vec<Block>),
    Replaced(Replacement),
    Rejected(String),
}

impl Reconciliation {
    pub fn changed_chain(&self) -> bool {
        matches!(
            self,
            Reconciliation::Appended(_) | Reconciliation::Replaced(_)
        )
    }
}

enum Step {
    Done(Reconciliation),
    NeedsChain(Block),
}

pub struct ConsensusCoordinator {
    chain: Arc<Blockchain>,
    registry: Arc<PeerRegistry>,
    bus: EventBus,
    fetch_attempts: u32,
}

impl ConsensusCoordinator {
    pub fn new(
        chain: Arc<Blockchain>,
        registry: Arc<PeerRegistry>,
        bus: EventBus,
        fetch_attempts: u32,
    ) -> Self {
        Self {
            chain,
            registry,
            bus,
            fetch_attempts: fetch_attempts.max(1),
        }
    }

    /// Reconcile `blocks` offered by `origin` (a peer url, `None` when the
    /// blocks were not received from a peer).
    pub async fn reconcile(&self, blocks: Vec<Block>, origin: Option<&str>) -> Reconciliation {
        match self.reconcile_once(blocks, origin, true).await {
            Step::Done(outcome) => outcome,
            Step::NeedsChain(block) => self.fetch_and_reconcile(&block, origin).await,
        }
    }

    /// Admit a peer's pending transactions locally. Known ids are skipped.
    pub async fn ingest_transactions(&self, pending: Vec<Transaction>, origin: &str) {
        let offered = pending.len();
        let mut admitted = 0usize;
        for tx in pending {
            let id = tx.transaction_id;
            match self.chain.add_transaction(tx).await {
                Ok(_) => admitted += 1,
                Err(ChainError::Validation(ValidationError::DuplicateTransaction(_))) => {}
                Err(e) => warn!(peer = origin, id, error = %e, "peer transaction refused"),
            }
        }
        debug!(peer = origin, offered, admitted, "synced peer mempool");
    }

    async fn reconcile_once(
        &self,
        mut blocks: Vec<Block>,
        origin: Option<&str>,
        may_fetch: bool,
    ) -> Step {
        let tip = match self.chain.tip() {
            Ok(tip) => tip,
            Err(e) => return Step::Done(Reconciliation::Rejected(format!("local tip unavailable: {}", e))),
        };

        blocks.retain(|block| {
            if !block.claims_genesis() {
                return true;
            }
            if !block.is_genesis() {
                warn!(peer = ?origin, hash = %block.short_hash(), "peer reports a different genesis block");
            }
            false
        });
        blocks.sort_by_key(|block| block.index);

        let highest = match blocks.last() {
            Some(block) => block.index,
            None => return Step::Done(Reconciliation::Ignored(IgnoreReason::NoCandidates)),
        };
        if highest <= tip.index {
            debug!(peer = ?origin, highest, tip = tip.index, "stale blocks ignored");
            return Step::Done(Reconciliation::Ignored(IgnoreReason::Stale));
        }

        let mut fresh = Vec::with_capacity(blocks.len());
        for block in blocks {
            if block.index <= tip.index {
                if let Ok(held) = self.chain.block_by_index(block.index) {
                    if held.hash == block.hash {
                        continue;
                    }
                }
            }
            fresh.push(block);
        }

        // `highest` is above the tip, so at least that block is fresh.
        if fresh.len() == 1 {
            let block = fresh.remove(0);
            if block.extends(&tip) {
                return Step::Done(self.append(block, origin).await);
            }
            if may_fetch {
                return Step::NeedsChain(block);
            }
            fresh.push(block);
        }
        Step::Done(self.adopt(fresh, origin).await)
    }

    async fn append(&self, block: Block, origin: Option<&str>) -> Reconciliation {
        let index = block.index;
        match self.chain.add_block(block).await {
            Ok(block) => {
                self.bus
                    .publish(NodeEvent::block_added(block.clone(), origin.map(str::to_string)));
                Reconciliation::Appended(vec![block])
            }
            Err(e) => {
                warn!(peer = ?origin, index, error = %e, "candidate block discarded");
                Reconciliation::Rejected(e.to_string())
            }
        }
    }

    /// Validate `segment` end to end and commit it atomically. A segment
    /// that only extends the tip is reported as an append.
    async fn adopt(&self, segment: Vec<Block>, origin: Option<&str>) -> Reconciliation {
        match self.chain.replace_chain(&segment).await {
            Ok(replacement) if replacement.dropped.is_empty() => {
                for block in &replacement.adopted {
                    self.bus
                        .publish(NodeEvent::block_added(block.clone(), origin.map(str::to_string)));
                }
                Reconciliation::Appended(replacement.adopted)
            }
            Ok(replacement) => {
                if let Some(tip) = replacement.new_tip() {
                    self.bus
                        .publish(NodeEvent::block_added(tip.clone(), origin.map(str::to_string)));
                }
                Reconciliation::Replaced(replacement)
            }
            Err(e) => {
                info!(peer = ?origin, blocks = segment.len(), error = %e, "candidate chain discarded");
                Reconciliation::Rejected(e.to_string())
            }
        }
    }

    /// Fetch the origin's chain (bounded retries), falling back to every
    /// other peer, and reconcile each fetched chain once.
    async fn fetch_and_reconcile(&self, block: &Block, origin: Option<&str>) -> Reconciliation {
        info!(peer = ?origin, index = block.index, "block does not extend our tip, fetching chains");

        let mut chains = Vec::new();
        if let Some(origin) = origin.filter(|o| !self.registry.is_self(o)) {
            match self.registry.fetch_chain(origin, self.fetch_attempts).await {
                Ok(chain) => chains.push((origin.to_string(), chain)),
                Err(e) => warn!(peer = origin, error = %e, "origin chain unavailable"),
            }
        }
        if chains.is_empty() {
            match self.registry.fetch_chains(origin).await {
                Ok(fetched) => chains = fetched,
                Err(e) => return Reconciliation::Rejected(e.to_string()),
            }
        }
        chains.sort_by_key(|(_, chain)| Reverse(chain.len()));

        let mut outcome = Reconciliation::Rejected(format!(
            "no peer supplied a chain for block {}",
            block.index
        ));
        for (source, chain) in chains {
            let result = match self.reconcile_once(chain, Some(&source), false).await {
                Step::Done(result) => result,
                Step::NeedsChain(_) => continue,
            };
            if result.changed_chain() {
                return result;
            }
            outcome = result;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Validator;
    use crate::error::NetworkError;
    use crate::network::{NetResult, PeerClient};
    use crate::peers::Peer;
    use crate::persistence::{InMemoryStore, PeerStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Serves fixed chains per url; unknown urls are unreachable.
    #[derive(Default)]
    struct ChainServer {
        chains: HashMap<String, Vec<Block>>,
        fetches: Mutex<Vec<String>>,
    }

    impl ChainServer {
        fn chain(&self, peer: &str) -> NetResult<Vec<Block>> {
            self.chains.get(peer).cloned().ok_or(NetworkError::Unreachable {
                url: peer.to_string(),
                reason: "no route".to_string(),
            })
        }
    }

    #[async_trait]
    impl PeerClient for ChainServer {
        async fn send_peer(&self, _peer: &str, _me: &Peer) -> NetResult<()> {
            Ok(())
        }
        async fn last_block(&self, peer: &str) -> NetResult<Block> {
            self.chain(peer)?.pop().ok_or(NetworkError::Status {
                url: peer.to_string(),
                status: 404,
            })
        }
        async fn blocks(&self, peer: &str) -> NetResult<Vec<Block>> {
            self.fetches.lock().push(peer.to_string());
            self.chain(peer)
        }
        async fn put_block(&self, _peer: &str, _block: &Block) -> NetResult<()> {
            Ok(())
        }
        async fn post_transaction(&self, _peer: &str, _tx: &Transaction) -> NetResult<()> {
            Ok(())
        }
        async fn transactions(&self, peer: &str) -> NetResult<Vec<Transaction>> {
            self.chain(peer).map(|_| Vec::new())
        }
        async fn has_transaction(&self, _peer: &str, _id: u64) -> NetResult<bool> {
            Ok(false)
        }
    }

    fn tx(id: u64) -> Transaction {
        Transaction::transfer(id, "alice", "bob", "deed", "sig")
    }

    fn next(prev: &Block, stamp: i64, txs: Vec<Transaction>) -> Block {
        Block::with_timestamp(prev.index + 1, prev.hash.clone(), stamp, txs)
    }

    struct Harness {
        coordinator: ConsensusCoordinator,
        chain: Arc<Blockchain>,
        server: Arc<ChainServer>,
        bus: EventBus,
    }

    async fn harness(chains: Vec<(&str, Vec<Block>)>, known: &[&str]) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        for url in known {
            store.save(&Peer::new(*url)).unwrap();
        }
        let chain = Arc::new(Blockchain::new(store.clone(), store.clone(), Validator::new()));
        chain.init().await.unwrap();

        let server = Arc::new(ChainServer {
            chains: chains
                .into_iter()
                .map(|(url, c)| (url.to_string(), c))
                .collect(),
            fetches: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(PeerRegistry::new(
            Peer::new("http://me:1"),
            store,
            server.clone(),
            Duration::from_millis(500),
        ));
        let bus = EventBus::new();
        Harness {
            coordinator: ConsensusCoordinator::new(chain.clone(), registry, bus.clone(), 2),
            chain,
            server,
            bus,
        }
    }

    #[tokio::test]
    async fn test_stale_and_genesis_batches_are_ignored() {
        let h = harness(Vec::new(), &[]).await;
        let genesis = Block::genesis();
        assert_eq!(
            h.coordinator.reconcile(vec![genesis.clone()], None).await,
            Reconciliation::Ignored(IgnoreReason::NoCandidates)
        );

        let a = next(&genesis, 1, Vec::new());
        h.chain.add_block(a.clone()).await.unwrap();
        let rival = next(&genesis, 2, Vec::new());
        assert_eq!(
            h.coordinator.reconcile(vec![rival], Some("http://p:1")).await,
            Reconciliation::Ignored(IgnoreReason::Stale)
        );
        assert_eq!(h.chain.tip().unwrap(), a);
        assert_eq!(h.bus.events_published(), 0);
    }

    #[tokio::test]
    async fn test_contiguous_blocks_are_appended() {
        let h = harness(Vec::new(), &[]).await;
        h.chain.add_transaction(tx(5)).await.unwrap();
        let genesis = Block::genesis();
        let a = next(&genesis, 1, vec![tx(5)]);
        let b = next(&a, 2, Vec::new());

        // Out of order on the wire, genesis included.
        let outcome = h
            .coordinator
            .reconcile(vec![b.clone(), genesis, a.clone()], Some("http://p:1"))
            .await;
        assert_eq!(outcome, Reconciliation::Appended(vec![a, b.clone()]));
        assert_eq!(h.chain.tip().unwrap(), b);
        assert!(h.chain.mempool().unwrap().is_empty());
        assert_eq!(h.bus.events_published(), 2);
    }

    #[tokio::test]
    async fn test_extending_batch_with_bad_block_commits_nothing() {
        let h = harness(Vec::new(), &[]).await;
        h.chain.add_transaction(tx(5)).await.unwrap();
        let genesis = Block::genesis();
        let a = next(&genesis, 1, vec![tx(5)]);
        let mut b = next(&a, 2, Vec::new());
        b.hash = "0".repeat(64);

        match h.coordinator.reconcile(vec![a, b], Some("http://p:1")).await {
            Reconciliation::Rejected(reason) => assert!(reason.contains("Invalid hash")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(h.chain.chain().unwrap(), vec![genesis]);
        assert_eq!(h.chain.mempool().unwrap(), vec![tx(5)]);
        assert_eq!(h.bus.events_published(), 0);
    }

    #[tokio::test]
    async fn test_lone_invalid_successor_is_rejected() {
        let h = harness(Vec::new(), &[]).await;
        let genesis = Block::genesis();
        let mut a = next(&genesis, 1, Vec::new());
        a.hash = "f".repeat(64);

        let outcome = h.coordinator.reconcile(vec![a], Some("http://p:1")).await;
        assert!(matches!(outcome, Reconciliation::Rejected(_)));
        assert_eq!(h.chain.chain().unwrap(), vec![genesis]);
        assert_eq!(h.bus.events_published(), 0);
    }

    #[tokio::test]
    async fn test_competing_block_then_segment() {
        let h = harness(Vec::new(), &[]).await;
        let genesis = Block::genesis();
        let a = next(&genesis, 1, Vec::new());
        h.chain.add_block(a.clone()).await.unwrap();

        let b = next(&genesis, 9, vec![tx(2)]);
        let outcome = h.coordinator.reconcile(vec![b], Some("http://p:1")).await;
        assert!(!outcome.changed_chain());

        let c = next(&a, 3, vec![tx(3)]);
        let outcome = h
            .coordinator
            .reconcile(vec![a.clone(), c.clone()], Some("http://p:1"))
            .await;
        assert_eq!(outcome, Reconciliation::Appended(vec![c.clone()]));
        assert_eq!(h.chain.chain().unwrap(), vec![genesis, a, c]);
    }

    #[tokio::test]
    async fn test_longer_fork_segment_replaces_suffix() {
        let h = harness(Vec::new(), &[]).await;
        let genesis = Block::genesis();
        let a = next(&genesis, 1, vec![tx(1)]);
        let b = next(&a, 2, vec![tx(2)]);
        h.chain.add_block(a.clone()).await.unwrap();
        h.chain.add_block(b).await.unwrap();

        let c = next(&a, 10, Vec::new());
        let d = next(&c, 11, Vec::new());
        match h.coordinator.reconcile(vec![c.clone(), d.clone()], Some("http://p:1")).await {
            Reconciliation::Replaced(replacement) => {
                assert_eq!(replacement.adopted, vec![c, d.clone()]);
                assert_eq!(replacement.restored, vec![2]);
            }
            other => panic!("expected replacement, got {:?}", other),
        }
        assert_eq!(h.chain.tip().unwrap(), d);
        assert_eq!(h.bus.events_published(), 1);
    }

    #[tokio::test]
    async fn test_equal_length_fork_is_discarded() {
        let h = harness(Vec::new(), &[]).await;
        let genesis = Block::genesis();
        let a = next(&genesis, 1, Vec::new());
        let b = next(&a, 2, Vec::new());
        h.chain.add_block(a.clone()).await.unwrap();
        h.chain.add_block(b.clone()).await.unwrap();

        let x = next(&genesis, 20, Vec::new());
        let y = next(&x, 21, Vec::new());
        let outcome = h.coordinator.reconcile(vec![x, y], Some("http://p:1")).await;
        assert_eq!(outcome, Reconciliation::Ignored(IgnoreReason::Stale));
        assert_eq!(h.chain.tip().unwrap(), b);
    }

    #[tokio::test]
    async fn test_invalid_segment_is_rejected_with_reason() {
        let h = harness(Vec::new(), &[]).await;
        let genesis = Block::genesis();
        let a = next(&genesis, 1, Vec::new());
        h.chain.add_block(a.clone()).await.unwrap();

        let x = next(&genesis, 20, Vec::new());
        let mut y = next(&x, 21, Vec::new());
        y.hash = "0".repeat(64);
        match h.coordinator.reconcile(vec![x, y], None).await {
            Reconciliation::Rejected(reason) => assert!(reason.contains("Invalid hash")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(h.chain.tip().unwrap(), a);
    }

    #[tokio::test]
    async fn test_gap_fetches_origin_chain() {
        let genesis = Block::genesis();
        let a = next(&genesis, 1, Vec::new());
        let b = next(&a, 2, Vec::new());
        let c = next(&b, 3, Vec::new());
        let remote = vec![genesis.clone(), a, b, c.clone()];

        let h = harness(vec![("http://origin:1", remote.clone())], &["http://origin:1"]).await;
        let outcome = h.coordinator.reconcile(vec![c.clone()], Some("http://origin:1")).await;
        assert!(outcome.changed_chain());
        assert_eq!(h.chain.chain().unwrap(), remote);
        assert_eq!(*h.server.fetches.lock(), vec!["http://origin:1".to_string()]);
    }

    #[tokio::test]
    async fn test_fork_falls_back_to_other_peers_when_origin_unreachable() {
        let genesis = Block::genesis();
        let x = next(&genesis, 5, Vec::new());
        let y = next(&x, 6, Vec::new());
        let remote = vec![genesis.clone(), x, y.clone()];

        let h = harness(
            vec![("http://other:1", remote.clone())],
            &["http://gone:1", "http://other:1"],
        )
        .await;
        let local = next(&genesis, 1, vec![tx(8)]);
        h.chain.add_block(local).await.unwrap();

        let outcome = h.coordinator.reconcile(vec![y.clone()], Some("http://gone:1")).await;
        assert!(matches!(outcome, Reconciliation::Replaced(_)));
        assert_eq!(h.chain.chain().unwrap(), remote);
        assert_eq!(h.chain.mempool().unwrap(), vec![tx(8)]);

        // Two attempts at the origin, then one fetch from the other peer.
        let fetches = h.server.fetches.lock().clone();
        assert_eq!(
            fetches,
            vec!["http://gone:1", "http://gone:1", "http://other:1"]
        );
    }

    #[tokio::test]
    async fn test_unresolvable_block_is_rejected() {
        let h = harness(Vec::new(), &[]).await;
        let orphan = Block::with_timestamp(7, "f".repeat(64), 7, Vec::new());
        let outcome = h.coordinator.reconcile(vec![orphan], None).await;
        assert!(matches!(outcome, Reconciliation::Rejected(_)));
        assert_eq!(h.chain.chain().unwrap(), vec![Block::genesis()]);
    }

    #[tokio::test]
    async fn test_ingest_skips_known_transactions() {
        let h = harness(Vec::new(), &[]).await;
        h.chain.add_transaction(tx(1)).await.unwrap();
        h.coordinator
            .ingest_transactions(vec![tx(1), tx(2)], "http://p:1")
            .await;
        let ids: Vec<u64> = h.chain.mempool().unwrap().iter().map(|t| t.transaction_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
