//! In-process event bus separating local state changes from replication.
//!
//! Each subscriber owns an unbounded queue drained by its own task, so a
//! publisher never waits on a handler and every subscriber sees events of a
//! kind in publish order.

use crate::blockchain::Block;
use crate::transaction::Transaction;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A replicated state change.
///
/// `origin` is the url of the peer the change came from, if any; fan-out
/// skips it so a change is not echoed back to its sender. It stays in
/// process and is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeEvent {
    BlockAdded {
        block: Block,
        #[serde(skip)]
        origin: Option<String>,
    },
    TransactionAdded {
        transaction: Transaction,
        #[serde(skip)]
        origin: Option<String>,
    },
    /// Ask every peer for its tip.
    GetBlocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BlockAdded,
    TransactionAdded,
    GetBlocks,
}

impl NodeEvent {
    pub fn block_added(block: Block, origin: Option<String>) -> Self {
        NodeEvent::BlockAdded { block, origin }
    }

    pub fn transaction_added(transaction: Transaction, origin: Option<String>) -> Self {
        NodeEvent::TransactionAdded {
            transaction,
            origin,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            NodeEvent::BlockAdded { .. } => EventKind::BlockAdded,
            NodeEvent::TransactionAdded { .. } => EventKind::TransactionAdded,
            NodeEvent::GetBlocks => EventKind::GetBlocks,
        }
    }

    pub fn origin(&self) -> Option<&str> {
        match self {
            NodeEvent::BlockAdded { origin, .. } | NodeEvent::TransactionAdded { origin, .. } => {
                origin.as_deref()
            }
            NodeEvent::GetBlocks => None,
        }
    }
}

/// Consumer side of a subscription. Handlers may see an event more than
/// once and must tolerate it.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: NodeEvent);
}

struct Subscriber {
    kind: EventKind,
    queue: mpsc::UnboundedSender<NodeEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<Vec<Subscriber>>,
    published: AtomicU64,
}

/// Cloneable handle; clones share the same subscriber set.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Must be called inside a tokio runtime;
    /// the worker task ends when the bus is dropped.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let (queue, mut rx) = mpsc::unbounded_channel::<NodeEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.handle(event).await;
            }
        });
        self.inner
            .subscribers
            .write()
            .push(Subscriber { kind, queue });
        debug!(?kind, "event subscriber registered");
    }

    /// Queue `event` for every subscriber of its kind. Returns how many
    /// subscribers it was queued for.
    pub fn publish(&self, event: NodeEvent) -> usize {
        let kind = event.kind();
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut closed = false;
        for subscriber in self.inner.subscribers.read().iter() {
            if subscriber.kind != kind {
                continue;
            }
            if subscriber.queue.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed = true;
            }
        }

        if closed {
            self.inner
                .subscribers
                .write()
                .retain(|s| !s.queue.is_closed());
        }

        trace!(?kind, delivered, "event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn events_published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}
