//! Transactional checkpoint storage.
//!
//! Checkpoint writes, dedup watermarks, and removals of one suspension must
//! commit together or not at all. The store therefore exposes explicit
//! transaction handles — [`StoreTransaction`] — threaded through the
//! transition and action executors as typed parameters rather than hidden in
//! ambient context.
//!
//! Two backends ship with the crate:
//! - [`InMemoryCheckpointStore`] — volatile, for tests and ephemeral runs
//! - `SqliteCheckpointStore` (feature `sqlite`) — durable, sqlx-backed
//!
//! # Design Principles
//!
//! - **Atomicity**: everything staged on a transaction lands on commit or
//!   not at all
//! - **Idempotency**: replaying an action list after a crash must not
//!   double-persist (writes are keyed by flow id, latest wins)
//! - **Isolation**: a transaction's staged writes are invisible to other
//!   transactions until commit

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::ids::{FlowId, SessionId};

/// Errors from checkpoint store operations.
#[derive(Clone, Debug, PartialEq, Eq, Error, Diagnostic)]
pub enum StoreError {
    /// No checkpoint exists for the flow.
    #[error("no checkpoint for flow {flow_id}")]
    #[diagnostic(code(flowstate::store::not_found))]
    NotFound { flow_id: FlowId },

    /// A checkpoint already exists where `add` expected none.
    #[error("checkpoint for flow {flow_id} already exists")]
    #[diagnostic(code(flowstate::store::conflict))]
    Conflict { flow_id: FlowId },

    /// Transient contention (deadlock, busy database). Safe to retry.
    #[error("store busy: {message}")]
    #[diagnostic(
        code(flowstate::store::busy),
        help("The flow retries from its last safe point with backoff.")
    )]
    Busy { message: String },

    /// Backend storage error (database, filesystem, poisoned lock).
    #[error("store backend error: {message}")]
    #[diagnostic(code(flowstate::store::backend))]
    Backend { message: String },
}

impl StoreError {
    /// Whether a safe-point retry is the right response.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Factory for store transactions.
///
/// All checkpoint reads and writes run inside a transaction; the transition
/// executor owns exactly one open transaction per flow between suspension
/// boundaries.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// One open store transaction.
///
/// Writes are staged and only become visible on [`commit`](Self::commit);
/// [`rollback`](Self::rollback) discards them. Reads observe the
/// transaction's own staged writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert the first checkpoint for a flow.
    async fn add(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()>;

    /// Replace the checkpoint of an existing flow.
    async fn update(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()>;

    /// Delete a flow's checkpoint. Removing an absent checkpoint is not an
    /// error: replays after a crash hit this path.
    async fn remove(&mut self, flow_id: FlowId) -> Result<()>;

    async fn get(&mut self, flow_id: FlowId) -> Result<Option<Vec<u8>>>;

    async fn list(&mut self) -> Result<Vec<(FlowId, Vec<u8>)>>;

    /// Record the highest outbound dedup sequence used on a session. This
    /// survives checkpoint-skipping (idempotent) suspensions so a replay
    /// never reuses a sequence number.
    async fn record_dedup_watermark(
        &mut self,
        flow_id: FlowId,
        session_id: SessionId,
        sequence: u64,
    ) -> Result<()>;

    /// Watermarks previously recorded for a flow.
    async fn dedup_watermarks(&mut self, flow_id: FlowId) -> Result<Vec<(SessionId, u64)>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Default)]
struct MemoryTables {
    checkpoints: FxHashMap<FlowId, Vec<u8>>,
    watermarks: FxHashMap<(FlowId, SessionId), u64>,
}

/// Volatile in-process checkpoint store.
///
/// Staged writes live on the transaction and are applied to the shared maps
/// under a write lock on commit, which is what makes the crash-injection
/// tests honest: anything not committed is simply gone.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<RwLock<MemoryTables>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            base: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }
}

enum StagedOp {
    Put(FlowId, Vec<u8>),
    Remove(FlowId),
    Watermark(FlowId, SessionId, u64),
}

struct InMemoryTransaction {
    base: Arc<RwLock<MemoryTables>>,
    staged: Vec<StagedOp>,
}

impl InMemoryTransaction {
    /// The blob this transaction would observe for `flow_id`: staged writes
    /// shadow the committed map.
    fn visible(&self, flow_id: FlowId) -> Result<Option<Vec<u8>>> {
        for op in self.staged.iter().rev() {
            match op {
                StagedOp::Put(id, blob) if *id == flow_id => return Ok(Some(blob.clone())),
                StagedOp::Remove(id) if *id == flow_id => return Ok(None),
                _ => {}
            }
        }
        let tables = self.base.read().map_err(poisoned)?;
        Ok(tables.checkpoints.get(&flow_id).cloned())
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend {
        message: format!("lock poisoned: {e}"),
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn add(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        if self.visible(flow_id)?.is_some() {
            return Err(StoreError::Conflict { flow_id });
        }
        self.staged.push(StagedOp::Put(flow_id, blob));
        Ok(())
    }

    async fn update(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<()> {
        if self.visible(flow_id)?.is_none() {
            return Err(StoreError::NotFound { flow_id });
        }
        self.staged.push(StagedOp::Put(flow_id, blob));
        Ok(())
    }

    async fn remove(&mut self, flow_id: FlowId) -> Result<()> {
        self.staged.push(StagedOp::Remove(flow_id));
        Ok(())
    }

    async fn get(&mut self, flow_id: FlowId) -> Result<Option<Vec<u8>>> {
        self.visible(flow_id)
    }

    async fn list(&mut self) -> Result<Vec<(FlowId, Vec<u8>)>> {
        let mut merged: FxHashMap<FlowId, Option<Vec<u8>>> = {
            let tables = self.base.read().map_err(poisoned)?;
            tables
                .checkpoints
                .iter()
                .map(|(id, blob)| (*id, Some(blob.clone())))
                .collect()
        };
        for op in &self.staged {
            match op {
                StagedOp::Put(id, blob) => {
                    merged.insert(*id, Some(blob.clone()));
                }
                StagedOp::Remove(id) => {
                    merged.insert(*id, None);
                }
                StagedOp::Watermark(..) => {}
            }
        }
        let mut listed: Vec<(FlowId, Vec<u8>)> = merged
            .into_iter()
            .filter_map(|(id, blob)| blob.map(|b| (id, b)))
            .collect();
        listed.sort_by_key(|(id, _)| *id);
        Ok(listed)
    }

    async fn record_dedup_watermark(
        &mut self,
        flow_id: FlowId,
        session_id: SessionId,
        sequence: u64,
    ) -> Result<()> {
        self.staged
            .push(StagedOp::Watermark(flow_id, session_id, sequence));
        Ok(())
    }

    async fn dedup_watermarks(&mut self, flow_id: FlowId) -> Result<Vec<(SessionId, u64)>> {
        let mut marks: FxHashMap<SessionId, u64> = {
            let tables = self.base.read().map_err(poisoned)?;
            tables
                .watermarks
                .iter()
                .filter(|((id, _), _)| *id == flow_id)
                .map(|((_, sid), seq)| (*sid, *seq))
                .collect()
        };
        for op in &self.staged {
            if let StagedOp::Watermark(id, sid, seq) = op {
                if *id == flow_id {
                    let entry = marks.entry(*sid).or_insert(0);
                    *entry = (*entry).max(*seq);
                }
            }
        }
        let mut listed: Vec<(SessionId, u64)> = marks.into_iter().collect();
        listed.sort_by_key(|(sid, _)| *sid);
        Ok(listed)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tables = self.base.write().map_err(poisoned)?;
        for op in self.staged {
            match op {
                StagedOp::Put(id, blob) => {
                    tables.checkpoints.insert(id, blob);
                }
                StagedOp::Remove(id) => {
                    tables.checkpoints.remove(&id);
                }
                StagedOp::Watermark(id, sid, seq) => {
                    let entry = tables.watermarks.entry((id, sid)).or_insert(0);
                    *entry = (*entry).max(seq);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();

        let mut txn = store.begin().await.unwrap();
        txn.add(flow_id, b"rev0".to_vec()).await.unwrap();

        let mut other = store.begin().await.unwrap();
        assert_eq!(other.get(flow_id).await.unwrap(), None);
        other.rollback().await.unwrap();

        txn.commit().await.unwrap();

        let mut after = store.begin().await.unwrap();
        assert_eq!(after.get(flow_id).await.unwrap(), Some(b"rev0".to_vec()));
        after.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();

        let mut txn = store.begin().await.unwrap();
        txn.add(flow_id, b"rev0".to_vec()).await.unwrap();
        txn.rollback().await.unwrap();

        let mut after = store.begin().await.unwrap();
        assert_eq!(after.get(flow_id).await.unwrap(), None);
        after.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn add_conflicts_with_an_existing_checkpoint() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();

        let mut txn = store.begin().await.unwrap();
        txn.add(flow_id, b"a".to_vec()).await.unwrap();
        txn.commit().await.unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second.add(flow_id, b"b".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        second.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn dedup_watermarks_keep_the_maximum() {
        let store = InMemoryCheckpointStore::new();
        let flow_id = FlowId::random();
        let sid = SessionId::from_raw(7);

        let mut txn = store.begin().await.unwrap();
        txn.record_dedup_watermark(flow_id, sid, 4).await.unwrap();
        txn.record_dedup_watermark(flow_id, sid, 2).await.unwrap();
        txn.commit().await.unwrap();

        let mut reader = store.begin().await.unwrap();
        assert_eq!(reader.dedup_watermarks(flow_id).await.unwrap(), vec![(sid, 4)]);
        reader.rollback().await.unwrap();
    }
}
