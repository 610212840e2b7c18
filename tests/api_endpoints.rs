//! Integration tests for the REST surface of a node.

use axum_test::TestServer;
use peerchain::api::{build_api_router, ConfirmationsResponse, ReconcileResponse};
use peerchain::network::LoopbackNetwork;
use peerchain::{Block, Config, Node, Transaction};
use serde_json::{json, Value};
use std::sync::Arc;

fn transfer_body(from: &str, to: &str) -> Value {
    json!({
        "data": {
            "input": { "address": from, "contract": "deed", "signature": "sig" },
            "outputs": [{ "address": to, "contract": "deed" }]
        }
    })
}

async fn started_server() -> (TestServer, Arc<Node>) {
    let network = LoopbackNetwork::new();
    let node = network.spawn_node(Config::ephemeral("http://api-node:1"));
    node.start().await.expect("node starts");
    let server = TestServer::new(build_api_router(node.clone())).expect("Failed to create test server");
    (server, node)
}

#[tokio::test]
async fn test_health_follows_node_state() {
    let network = LoopbackNetwork::new();
    let node = network.spawn_node(Config::ephemeral("http://api-node:1"));
    let server = TestServer::new(build_api_router(node.clone())).expect("Failed to create test server");

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 503);
    let json: Value = response.json();
    assert_eq!(json["nodeState"], "booting");

    node.start().await.unwrap();
    let response = server.get("/health").await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["nodeState"], "ready");
    assert_eq!(json["selfUrl"], "http://api-node:1");
    assert_eq!(json["height"], 0);
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_block_reads() {
    let (server, _node) = started_server().await;
    let genesis = Block::genesis();

    let chain: Vec<Block> = server.get("/block").await.json();
    assert_eq!(chain, vec![genesis.clone()]);

    let last: Block = server.get("/block/last").await.json();
    assert_eq!(last, genesis);

    let by_index: Block = server.get("/block/index/0").await.json();
    assert_eq!(by_index, genesis);

    let by_hash: Block = server.get(&format!("/block/{}", genesis.hash)).await.json();
    assert_eq!(by_hash, genesis);

    let response = server.get("/block/index/9").await;
    assert_eq!(response.status_code(), 404);
    let json: Value = response.json();
    assert!(json["error"].as_str().unwrap().starts_with("Not found"));

    assert_eq!(server.get("/block/unknown-hash").await.status_code(), 404);
    assert_eq!(server.get("/block/index/not-a-number").await.status_code(), 400);
}

#[tokio::test]
async fn test_transaction_submission_and_lookup() {
    let (server, _node) = started_server().await;

    let response = server.post("/transaction/42").json(&transfer_body("alice", "bob")).await;
    assert_eq!(response.status_code(), 200);
    let tx: Transaction = response.json();
    assert_eq!(tx.transaction_id, 42);
    assert_eq!(tx.hash, tx.calculate_hash());

    // Same id again is a duplicate.
    let response = server.post("/transaction/42").json(&transfer_body("carol", "dave")).await;
    assert_eq!(response.status_code(), 409);

    // Body id must agree with the path.
    let mut body = transfer_body("alice", "bob");
    body["transactionId"] = json!(7);
    assert_eq!(server.post("/transaction/8").json(&body).await.status_code(), 400);

    let mempool: Vec<Transaction> = server.get("/transaction").await.json();
    assert_eq!(mempool, vec![tx.clone()]);

    let fetched: Transaction = server.get("/transaction/42").await.json();
    assert_eq!(fetched, tx);
    assert_eq!(server.get("/transaction/43").await.status_code(), 404);
}

#[tokio::test]
async fn test_mine_commits_mempool() {
    let (server, node) = started_server().await;
    server.post("/transaction/42").json(&transfer_body("alice", "bob")).await;

    let response = server.post("/miner/mine/miner-1").await;
    assert_eq!(response.status_code(), 200);
    let block: Block = response.json();
    assert_eq!(block.index, 1);
    assert!(block.contains_transaction(42));
    assert_eq!(node.get_last_block().unwrap(), block);

    let mempool: Vec<Transaction> = server.get("/transaction").await.json();
    assert!(mempool.is_empty());

    let holder: Block = server.get("/block/blocks/transaction/42").await.json();
    assert_eq!(holder.index, 1);
    assert_eq!(server.get("/block/blocks/transaction/99").await.status_code(), 404);

    let confirmations: ConfirmationsResponse =
        server.get("/node/transactions/42/confirmations").await.json();
    assert_eq!(
        confirmations,
        ConfirmationsResponse { transaction_id: 42, confirmations: 1 }
    );
}

#[tokio::test]
async fn test_post_block_validates() {
    let (server, _node) = started_server().await;
    let genesis = Block::genesis();

    let wrong_parent = Block::new(1, "not-the-tip".to_string(), vec![]);
    assert_eq!(server.post("/block").json(&wrong_parent).await.status_code(), 409);

    let block = Block::new(1, genesis.hash.clone(), vec![Transaction::transfer(3, "a", "b", "c", "s")]);
    let response = server.post("/block").json(&block).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Block>(), block);
}

#[tokio::test]
async fn test_offered_block_is_reconciled() {
    let (server, _node) = started_server().await;
    let genesis = Block::genesis();

    let mut tampered = Block::new(1, genesis.hash.clone(), vec![]);
    tampered.hash = "forged".to_string();
    let outcome: ReconcileResponse = server.put("/block/last").json(&tampered).await.json();
    assert_eq!(outcome.outcome, "rejected");
    assert_eq!(outcome.tip, 0);

    let block = Block::new(1, genesis.hash.clone(), vec![]);
    let outcome: ReconcileResponse = server.put("/block/last").json(&block).await.json();
    assert_eq!(
        outcome,
        ReconcileResponse { outcome: "appended".to_string(), reason: None, tip: 1 }
    );

    let outcome: ReconcileResponse = server.put("/block/last").json(&block).await.json();
    assert_eq!(outcome.outcome, "ignored");
    assert_eq!(outcome.reason.as_deref(), Some("stale"));
}

#[tokio::test]
async fn test_peer_announcements() {
    let (server, _node) = started_server().await;

    let peers: Vec<Value> = server.get("/node/peers").await.json();
    assert!(peers.is_empty());

    let response = server.post("/node/peers").json(&json!({ "url": "ftp://nope" })).await;
    assert_eq!(response.status_code(), 400);

    let response = server.post("/node/peers").json(&json!({ "url": "http://api-node:1/" })).await;
    assert_eq!(response.status_code(), 200);
    let json: Value = response.json();
    assert_eq!(json["url"], "http://api-node:1");
}
