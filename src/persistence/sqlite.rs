//! Durable backend on a single sqlite connection.

use super::{LedgerStore, MempoolStore, PeerStore};
use crate::blockchain::Block;
use crate::error::{ChainError, Result};
use crate::peers::Peer;
use crate::transaction::Transaction;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS blocks (
        height INTEGER PRIMARY KEY,
        hash TEXT NOT NULL UNIQUE,
        previous_hash TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        nonce INTEGER NOT NULL,
        transactions TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS block_transactions (
        transaction_id INTEGER PRIMARY KEY,
        height INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_block_transactions_height
        ON block_transactions(height);
    CREATE TABLE IF NOT EXISTS mempool (
        transaction_id INTEGER PRIMARY KEY,
        body TEXT NOT NULL,
        seq INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS peers (
        url TEXT PRIMARY KEY,
        seq INTEGER NOT NULL
    );
";

const BLOCK_COLUMNS: &str = "height, hash, previous_hash, timestamp, nonce, transactions";

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> ChainError {
    move |e| ChainError::DatabaseError(format!("{}: {}", context, e))
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<(Block, String)> {
    let block = Block {
        index: row.get::<_, i64>(0)? as u64,
        hash: row.get(1)?,
        previous_hash: row.get(2)?,
        timestamp: row.get(3)?,
        nonce: row.get::<_, i64>(4)? as u64,
        transactions: Vec::new(),
    };
    Ok((block, row.get(5)?))
}

fn decode_block((mut block, transactions): (Block, String)) -> Result<Block> {
    block.transactions = serde_json::from_str(&transactions).map_err(|e| {
        ChainError::DatabaseError(format!(
            "Failed to decode transactions of block {}: {}",
            block.index, e
        ))
    })?;
    Ok(block)
}

fn insert_block(conn: &Connection, block: &Block) -> Result<()> {
    let transactions = serde_json::to_string(&block.transactions)?;
    conn.execute(
        "INSERT INTO blocks (height, hash, previous_hash, timestamp, nonce, transactions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            block.index as i64,
            block.hash,
            block.previous_hash,
            block.timestamp,
            block.nonce as i64,
            transactions,
        ],
    )
    .map_err(db_err("Failed to save block"))?;

    for id in block.transaction_ids() {
        conn.execute(
            "INSERT INTO block_transactions (transaction_id, height) VALUES (?1, ?2)",
            params![id as i64, block.index as i64],
        )
        .map_err(db_err("Failed to index transaction"))?;
    }
    Ok(())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("Failed to open database"))?;
        Self::with_connection(conn)
    }

    /// A private in-process database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("Failed to open database"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(db_err("Failed to create schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    fn query_block(&self, filter: &str, param: rusqlite::types::Value) -> Result<Option<Block>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM blocks {}", BLOCK_COLUMNS, filter);
        conn.query_row(&sql, [param], block_from_row)
            .optional()
            .map_err(db_err("Failed to query block"))?
            .map(decode_block)
            .transpose()
    }

    fn blocks_from(conn: &Connection, from_index: u64) -> Result<Vec<Block>> {
        let sql = format!(
            "SELECT {} FROM blocks WHERE height >= ?1 ORDER BY height ASC",
            BLOCK_COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([from_index as i64], block_from_row)
            .map_err(db_err("Failed to query blocks"))?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(decode_block(row.map_err(db_err("Failed to read row"))?)?);
        }
        Ok(blocks)
    }
}

impl LedgerStore for SqliteStore {
    fn append(&self, block: &Block) -> Result<()> {
        let conn = self.conn()?;
        let occupied: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM blocks WHERE height = ?1)",
                [block.index as i64],
                |row| row.get(0),
            )
            .map_err(db_err("Failed to query block"))?;
        if occupied {
            return Err(ChainError::Consistency(format!(
                "block index {} already stored",
                block.index
            )));
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(db_err("Failed to begin transaction"))?;
        insert_block(&tx, block)?;
        tx.commit().map_err(db_err("Failed to commit block"))
    }

    fn by_hash(&self, hash: &str) -> Result<Option<Block>> {
        self.query_block("WHERE hash = ?1", hash.to_string().into())
    }

    fn by_index(&self, index: u64) -> Result<Option<Block>> {
        self.query_block("WHERE height = ?1", (index as i64).into())
    }

    fn tip(&self) -> Result<Option<Block>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM blocks ORDER BY height DESC LIMIT 1",
                BLOCK_COLUMNS
            ),
            [],
            block_from_row,
        )
        .optional()
        .map_err(db_err("Failed to query tip"))?
        .map(decode_block)
        .transpose()
    }

    fn all(&self) -> Result<Vec<Block>> {
        let conn = self.conn()?;
        Self::blocks_from(&conn, 0)
    }

    fn replace_from(&self, from_index: u64, blocks: &[Block]) -> Result<Vec<Block>> {
        let conn = self.conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(db_err("Failed to begin transaction"))?;

        let removed = Self::blocks_from(&tx, from_index)?;
        tx.execute("DELETE FROM blocks WHERE height >= ?1", [from_index as i64])
            .map_err(db_err("Failed to drop blocks"))?;
        tx.execute(
            "DELETE FROM block_transactions WHERE height >= ?1",
            [from_index as i64],
        )
        .map_err(db_err("Failed to drop transaction index"))?;

        for block in blocks {
            insert_block(&tx, block)?;
        }

        tx.commit().map_err(db_err("Failed to commit replacement"))?;
        Ok(removed)
    }

    fn find_transaction(&self, transaction_id: u64) -> Result<Option<Block>> {
        let height: Option<i64> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT height FROM block_transactions WHERE transaction_id = ?1",
                [transaction_id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to query transaction index"))?
        };
        match height {
            Some(height) => self.by_index(height as u64),
            None => Ok(None),
        }
    }
}

impl MempoolStore for SqliteStore {
    fn put(&self, tx: &Transaction) -> Result<()> {
        let body = serde_json::to_string(tx)?;
        self.conn()?
            .execute(
                "INSERT INTO mempool (transaction_id, body, seq)
                 VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM mempool))
                 ON CONFLICT(transaction_id) DO UPDATE SET body = excluded.body",
                params![tx.transaction_id as i64, body],
            )
            .map_err(db_err("Failed to save transaction"))?;
        Ok(())
    }

    fn remove(&self, transaction_id: u64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "DELETE FROM mempool WHERE transaction_id = ?1 RETURNING body",
                [transaction_id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to remove transaction"))?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn get(&self, transaction_id: u64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM mempool WHERE transaction_id = ?1",
                [transaction_id as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Failed to query transaction"))?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn all(&self) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT body FROM mempool ORDER BY seq ASC")
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err("Failed to query mempool"))?;

        let mut pending = Vec::new();
        for row in rows {
            let body = row.map_err(db_err("Failed to read row"))?;
            pending.push(serde_json::from_str(&body)?);
        }
        Ok(pending)
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM mempool", [], |row| row.get(0))
            .map_err(db_err("Failed to count mempool"))?;
        Ok(count as usize)
    }
}

impl PeerStore for SqliteStore {
    fn save(&self, peer: &Peer) -> Result<bool> {
        let inserted = self
            .conn()?
            .execute(
                "INSERT OR IGNORE INTO peers (url, seq)
                 VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM peers))",
                [&peer.url],
            )
            .map_err(db_err("Failed to save peer"))?;
        Ok(inserted == 1)
    }

    fn find_by_url(&self, url: &str) -> Result<Option<Peer>> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row("SELECT url FROM peers WHERE url = ?1", [url], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err("Failed to query peer"))?;
        Ok(found.map(Peer::new))
    }

    fn all(&self) -> Result<Vec<Peer>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT url FROM peers ORDER BY seq ASC")
            .map_err(db_err("Failed to prepare query"))?;
        let urls = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err("Failed to query peers"))?;

        let mut peers = Vec::new();
        for url in urls {
            peers.push(Peer::new(url.map_err(db_err("Failed to read row"))?));
        }
        Ok(peers)
    }
}
