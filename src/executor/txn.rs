//! The explicit transaction handle threaded through transition execution.
//!
//! A [`FlowTransaction`] wraps one open store transaction plus the staged
//! broker acknowledgements. Outbound envelopes go straight to the
//! at-least-once bus when their action is applied — a crash between a send
//! and the commit re-runs the suspension from the previous checkpoint and
//! re-emits the same envelopes with identical dedup ids, so the receiving
//! de-duplicator collapses the overlap. Acknowledgements are the opposite:
//! they are flushed only *after* the store commit, because an
//! unacknowledged message redelivers, which is the safe failure direction.

use crate::bus::MessageBus;
use crate::checkpoint::store::{CheckpointStore, StoreError, StoreTransaction};
use crate::errors::FlowError;
use crate::ids::{FlowId, PeerId, SessionId};

pub struct FlowTransaction {
    store_txn: Box<dyn StoreTransaction>,
    acks: Vec<String>,
}

impl FlowTransaction {
    pub async fn begin(store: &dyn CheckpointStore) -> Result<Self, StoreError> {
        Ok(Self {
            store_txn: store.begin().await?,
            acks: Vec::new(),
        })
    }

    /// Stage broker acknowledgements for flush after commit.
    pub fn stage_acks(&mut self, deduplication_ids: Vec<String>) {
        self.acks.extend(deduplication_ids);
    }

    /// Upsert the flow's checkpoint blob.
    pub async fn persist(&mut self, flow_id: FlowId, blob: Vec<u8>) -> Result<(), StoreError> {
        match self.store_txn.update(flow_id, blob.clone()).await {
            Err(StoreError::NotFound { .. }) => self.store_txn.add(flow_id, blob).await,
            other => other,
        }
    }

    pub async fn remove(&mut self, flow_id: FlowId) -> Result<(), StoreError> {
        self.store_txn.remove(flow_id).await
    }

    pub async fn get(&mut self, flow_id: FlowId) -> Result<Option<Vec<u8>>, StoreError> {
        self.store_txn.get(flow_id).await
    }

    pub async fn list(&mut self) -> Result<Vec<(FlowId, Vec<u8>)>, StoreError> {
        self.store_txn.list().await
    }

    pub async fn record_dedup_watermark(
        &mut self,
        flow_id: FlowId,
        session_id: SessionId,
        sequence: u64,
    ) -> Result<(), StoreError> {
        self.store_txn
            .record_dedup_watermark(flow_id, session_id, sequence)
            .await
    }

    pub async fn dedup_watermarks(
        &mut self,
        flow_id: FlowId,
    ) -> Result<Vec<(SessionId, u64)>, StoreError> {
        self.store_txn.dedup_watermarks(flow_id).await
    }

    /// Commit the store transaction, then acknowledge consumed messages.
    ///
    /// Acknowledgement failure after a durable commit is swallowed with a
    /// warning: the broker redelivers and the inbound sequence filter drops
    /// the replays. Failing the flow here would desynchronize the persisted
    /// shadow from the store.
    pub async fn commit(
        self,
        our_identity: &PeerId,
        bus: &dyn MessageBus,
    ) -> Result<(), FlowError> {
        let Self { store_txn, acks } = self;
        store_txn.commit().await?;
        if !acks.is_empty() {
            if let Err(error) = bus.acknowledge(&acks).await {
                tracing::warn!(identity = %our_identity, error = %error, "ack flush failed");
            }
        }
        Ok(())
    }

    /// Discard everything staged on this transaction.
    pub async fn rollback(self) -> Result<(), StoreError> {
        self.store_txn.rollback().await
    }
}
