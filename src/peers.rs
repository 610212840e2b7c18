//! Known peers, the introduction handshake and concurrent fan-out.
//!
//! Every remote call is bounded by the configured peer timeout. A failing
//! peer only fails its own call: fan-outs log the failure and carry on, and
//! the peer stays registered.

use crate::blockchain::Block;
use crate::consensus::ConsensusCoordinator;
use crate::error::{NetworkError, Result};
use crate::network::{NetResult, PeerClient};
use crate::persistence::PeerStore;
use crate::transaction::Transaction;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A node reachable at `url`. Peers are identified by url value, compared
/// after trimming trailing slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub url: String,
}

impl Peer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_url(&url.into()),
        }
    }

    /// Like [`Peer::new`] but rejects anything that is not an http(s) url.
    pub fn parse(url: &str) -> std::result::Result<Self, NetworkError> {
        let peer = Self::new(url);
        match reqwest::Url::parse(&peer.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => {
                Ok(peer)
            }
            _ => Err(NetworkError::InvalidUrl(url.to_string())),
        }
    }
}

pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// How a fan-out went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    pub attempted: usize,
    pub delivered: usize,
}

pub struct PeerRegistry {
    me: Peer,
    store: Arc<dyn PeerStore>,
    client: Arc<dyn PeerClient>,
    timeout: Duration,
}

impl PeerRegistry {
    pub fn new(
        me: Peer,
        store: Arc<dyn PeerStore>,
        client: Arc<dyn PeerClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            me,
            store,
            client,
            timeout,
        }
    }

    pub fn me(&self) -> &Peer {
        &self.me
    }

    pub fn is_self(&self, url: &str) -> bool {
        normalize_url(url) == self.me.url
    }

    /// Known peers, never including this node.
    pub fn peers(&self) -> Result<Vec<Peer>> {
        Ok(self
            .store
            .all()?
            .into_iter()
            .filter(|p| p.url != self.me.url)
            .collect())
    }

    pub fn is_known(&self, url: &str) -> Result<bool> {
        Ok(self.store.find_by_url(&normalize_url(url))?.is_some())
    }

    async fn call<T, F>(&self, peer: &str, fut: F) -> NetResult<T>
    where
        F: Future<Output = NetResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout {
                url: peer.to_string(),
            }),
        }
    }

    /// Register `url` and exchange state with it.
    ///
    /// Our own url and already known urls are no-ops. Otherwise the peer is
    /// persisted, told about us, its tip and mempool are pulled in through
    /// `consensus`, and it is introduced to every other known peer.
    pub async fn handshake(&self, url: &str, consensus: &ConsensusCoordinator) -> Result<Peer> {
        let peer = Peer::parse(url)?;
        if self.is_self(&peer.url) {
            debug!(peer = %peer.url, "ignoring handshake with self");
            return Ok(peer);
        }
        if !self.store.save(&peer)? {
            debug!(peer = %peer.url, "peer already known");
            return Ok(peer);
        }
        info!(peer = %peer.url, "new peer registered");

        if let Err(e) = self
            .call(&peer.url, self.client.send_peer(&peer.url, &self.me))
            .await
        {
            warn!(peer = %peer.url, error = %e, "failed to announce ourselves");
        }

        match self.call(&peer.url, self.client.last_block(&peer.url)).await {
            Ok(tip) => {
                let outcome = consensus.reconcile(vec![tip], Some(peer.url.as_str())).await;
                debug!(peer = %peer.url, ?outcome, "reconciled peer tip");
            }
            Err(e) => warn!(peer = %peer.url, error = %e, "failed to fetch peer tip"),
        }

        match self.call(&peer.url, self.client.transactions(&peer.url)).await {
            Ok(pending) => consensus.ingest_transactions(pending, &peer.url).await,
            Err(e) => warn!(peer = %peer.url, error = %e, "failed to fetch peer mempool"),
        }

        let introduced = self.introduce(&peer).await?;
        debug!(peer = %peer.url, ?introduced, "introduced peer to the network");
        Ok(peer)
    }

    /// Tell every other known peer about `peer`.
    pub async fn introduce(&self, peer: &Peer) -> Result<Fanout> {
        let targets: Vec<Peer> = self
            .peers()?
            .into_iter()
            .filter(|p| p.url != peer.url)
            .collect();
        Ok(self
            .fan_out(&targets, |target| async move {
                self.client.send_peer(&target.url, peer).await
            })
            .await)
    }

    /// Offer `block` to every peer except `origin`.
    pub async fn broadcast_block(&self, block: &Block, origin: Option<&str>) -> Result<Fanout> {
        let targets = self.targets_except(origin)?;
        let fanout = self
            .fan_out(&targets, |target| async move {
                self.client.put_block(&target.url, block).await
            })
            .await;
        debug!(index = block.index, ?fanout, "block broadcast");
        Ok(fanout)
    }

    /// Post `tx` to every peer except `origin`.
    pub async fn broadcast_transaction(
        &self,
        tx: &Transaction,
        origin: Option<&str>,
    ) -> Result<Fanout> {
        let targets = self.targets_except(origin)?;
        let fanout = self
            .fan_out(&targets, |target| async move {
                self.client.post_transaction(&target.url, tx).await
            })
            .await;
        debug!(id = tx.transaction_id, ?fanout, "transaction broadcast");
        Ok(fanout)
    }

    /// Fetch the full chain of `url`, retrying up to `attempts` times.
    pub async fn fetch_chain(&self, url: &str, attempts: u32) -> NetResult<Vec<Block>> {
        let mut last_err = NetworkError::Unreachable {
            url: url.to_string(),
            reason: "no attempt made".to_string(),
        };
        for attempt in 1..=attempts.max(1) {
            match self.call(url, self.client.blocks(url)).await {
                Ok(chain) => return Ok(chain),
                Err(e) => {
                    debug!(peer = url, attempt, error = %e, "chain fetch failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Full chains of every peer except `except`, fetched concurrently.
    pub async fn fetch_chains(&self, except: Option<&str>) -> Result<Vec<(String, Vec<Block>)>> {
        let targets = self.targets_except(except)?;
        let results = join_all(targets.iter().map(|peer| async move {
            (
                peer.url.clone(),
                self.call(&peer.url, self.client.blocks(&peer.url)).await,
            )
        }))
        .await;
        Ok(Self::keep_successes(results, "chain fetch"))
    }

    /// Tip of every known peer, fetched concurrently.
    pub async fn fetch_tips(&self) -> Result<Vec<(String, Block)>> {
        let targets = self.peers()?;
        let results = join_all(targets.iter().map(|peer| async move {
            (
                peer.url.clone(),
                self.call(&peer.url, self.client.last_block(&peer.url)).await,
            )
        }))
        .await;
        Ok(Self::keep_successes(results, "tip fetch"))
    }

    /// Number of peers reporting `transaction_id` as committed.
    pub async fn count_remote_confirmations(&self, transaction_id: u64) -> Result<u64> {
        let targets = self.peers()?;
        let answers = join_all(targets.iter().map(|peer| async move {
            self.call(
                &peer.url,
                self.client.has_transaction(&peer.url, transaction_id),
            )
            .await
        }))
        .await;

        let mut confirmations = 0;
        for answer in answers {
            match answer {
                Ok(true) => confirmations += 1,
                Ok(false) => {}
                Err(e) => debug!(peer = e.url(), error = %e, "confirmation query failed"),
            }
        }
        Ok(confirmations)
    }

    fn targets_except(&self, origin: Option<&str>) -> Result<Vec<Peer>> {
        let origin = origin.map(normalize_url);
        Ok(self
            .peers()?
            .into_iter()
            .filter(|p| origin.as_deref() != Some(p.url.as_str()))
            .collect())
    }

    async fn fan_out<'a, F, Fut>(&'a self, targets: &'a [Peer], call: F) -> Fanout
    where
        F: Fn(&'a Peer) -> Fut,
        Fut: Future<Output = NetResult<()>> + 'a,
    {
        let results = join_all(
            targets
                .iter()
                .map(|target| self.call(&target.url, call(target))),
        )
        .await;

        let mut fanout = Fanout {
            attempted: results.len(),
            delivered: 0,
        };
        for result in results {
            match result {
                Ok(()) => fanout.delivered += 1,
                Err(e) => warn!(peer = e.url(), error = %e, "peer call failed"),
            }
        }
        fanout
    }

    fn keep_successes<T>(results: Vec<(String, NetResult<T>)>, what: &str) -> Vec<(String, T)> {
        results
            .into_iter()
            .filter_map(|(url, result)| match result {
                Ok(value) => Some((url, value)),
                Err(e) => {
                    warn!(peer = %url, error = %e, "{} failed", what);
                    None
                }
            })
            .collect()
    }
}
