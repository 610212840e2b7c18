use super::{NetResult, PeerClient, ORIGIN_HEADER};
use crate::blockchain::Block;
use crate::error::{ChainError, NetworkError, Result};
use crate::peers::Peer;
use crate::transaction::Transaction;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;

/// JSON-over-HTTP peer client with a per-request timeout.
pub struct HttpPeerClient {
    client: Client,
    origin: String,
}

impl HttpPeerClient {
    /// `origin` is this node's own url, sent in [`ORIGIN_HEADER`].
    pub fn new(origin: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ChainError::Config(format!("Failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            origin: origin.to_string(),
        })
    }

    fn classify(peer: &str, err: reqwest::Error) -> NetworkError {
        let url = peer.to_string();
        if err.is_timeout() {
            NetworkError::Timeout { url }
        } else if err.is_decode() {
            NetworkError::Decode {
                url,
                reason: err.to_string(),
            }
        } else if err.is_builder() {
            NetworkError::InvalidUrl(url)
        } else if let Some(status) = err.status() {
            NetworkError::Status {
                url,
                status: status.as_u16(),
            }
        } else {
            NetworkError::Unreachable {
                url,
                reason: err.to_string(),
            }
        }
    }

    fn request(&self, method: reqwest::Method, peer: &str, path: &str) -> RequestBuilder {
        trace!(method = method.as_str(), peer, path, "peer request");
        self.client
            .request(method, format!("{}{}", peer, path))
            .header(ORIGIN_HEADER, &self.origin)
    }

    async fn send(&self, peer: &str, request: RequestBuilder) -> NetResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Self::classify(peer, e))?;
        if !response.status().is_success() {
            return Err(NetworkError::Status {
                url: peer.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, peer: &str, path: &str) -> NetResult<T> {
        let response = self
            .send(peer, self.request(reqwest::Method::GET, peer, path))
            .await?;
        response
            .json::<T>()
            .await
            .map_err(|e| Self::classify(peer, e))
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn send_peer(&self, peer: &str, me: &Peer) -> NetResult<()> {
        let request = self.request(reqwest::Method::POST, peer, "/node/peers").json(me);
        self.send(peer, request).await.map(|_| ())
    }

    async fn last_block(&self, peer: &str) -> NetResult<Block> {
        self.get_json(peer, "/block/last").await
    }

    async fn blocks(&self, peer: &str) -> NetResult<Vec<Block>> {
        self.get_json(peer, "/block").await
    }

    async fn put_block(&self, peer: &str, block: &Block) -> NetResult<()> {
        let request = self
            .request(reqwest::Method::PUT, peer, "/block/last")
            .json(block);
        self.send(peer, request).await.map(|_| ())
    }

    async fn post_transaction(&self, peer: &str, tx: &Transaction) -> NetResult<()> {
        let path = format!("/transaction/{}", tx.transaction_id);
        let request = self.request(reqwest::Method::POST, peer, &path).json(tx);
        self.send(peer, request).await.map(|_| ())
    }

    async fn transactions(&self, peer: &str) -> NetResult<Vec<Transaction>> {
        self.get_json(peer, "/transaction").await
    }

    async fn has_transaction(&self, peer: &str, transaction_id: u64) -> NetResult<bool> {
        let path = format!("/block/blocks/transaction/{}", transaction_id);
        match self
            .send(peer, self.request(reqwest::Method::GET, peer, &path))
            .await
        {
            Ok(_) => Ok(true),
            Err(NetworkError::Status { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
