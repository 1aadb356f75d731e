//! Message-oriented transport seam and request/response correlation.
//!
//! The core never touches sockets: it hands frames to a [`FrameTransport`]
//! and matches replies back to callers through the [`TransactionPool`].
//! Frames within one connection arrive in send order; that is the only
//! ordering the pool relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{Result, StoreError};
use crate::routing::NodeAddr;
use crate::wire::Frame;

#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Deliver one frame from `from` to `to`.
    async fn send(&self, from: &NodeAddr, to: &NodeAddr, frame: Frame) -> Result<()>;
}

/// Outstanding request transactions keyed by the wire `trans` field.
#[derive(Default)]
pub struct TransactionPool {
    next_trans: AtomicU64,
    pending: Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>,
}

impl TransactionPool {
    pub fn new() -> Arc<TransactionPool> {
        Arc::new(TransactionPool::default())
    }

    /// Allocate a transaction id and the completion handle its replies
    /// will arrive on.
    pub fn begin(self: &Arc<Self>) -> TransactionHandle {
        let trans = self.next_trans.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(trans, tx);
        TransactionHandle {
            trans,
            rx,
            pool: Arc::clone(self),
            open: true,
        }
    }

    /// Route a reply frame to its waiting transaction. The final frame of
    /// a transaction (no MORE flag) retires the entry; frames for retired
    /// or abandoned transactions are dropped.
    pub fn complete(&self, frame: Frame) {
        let trans = frame.header.trans;
        let more = frame.header.has_more();

        let mut pending = self.pending.lock();
        let Some(tx) = pending.get(&trans) else {
            tracing::debug!("dropping late reply for abandoned transaction {}", trans);
            return;
        };

        let delivered = tx.send(frame).is_ok();
        if !more || !delivered {
            pending.remove(&trans);
        }
    }

    fn abandon(&self, trans: u64) {
        self.pending.lock().remove(&trans);
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Completion side of one transaction.
///
/// Dropping the handle abandons the transaction: the pool forgets it and
/// any response still in flight is discarded on arrival.
pub struct TransactionHandle {
    trans: u64,
    rx: mpsc::UnboundedReceiver<Frame>,
    pool: Arc<TransactionPool>,
    open: bool,
}

impl TransactionHandle {
    pub fn trans(&self) -> u64 {
        self.trans
    }

    /// Next reply frame, or `Timeout` once the deadline passes.
    pub async fn recv(&mut self, deadline: Instant) -> Result<Frame> {
        if !self.open {
            return Err(StoreError::NotFound);
        }

        let frame = tokio::time::timeout_at(deadline, self.rx.recv())
            .await
            .map_err(|_| StoreError::Timeout)?
            .ok_or(StoreError::Timeout)?;

        if !frame.header.has_more() {
            self.open = false;
        }
        Ok(frame)
    }

    /// Collect replies until the final frame (no MORE flag) arrives.
    pub async fn collect(&mut self, deadline: Instant) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            let frame = self.recv(deadline).await?;
            let last = !frame.header.has_more();
            frames.push(frame);
            if last {
                return Ok(frames);
            }
        }
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        self.pool.abandon(self.trans);
    }
}

/// In-process mesh: every registered node gets an inbox; frames go from
/// sender to receiver over an ordered channel. Used by multi-node tests
/// and by single-process deployments.
#[derive(Default)]
pub struct LoopbackMesh {
    inboxes: Mutex<HashMap<NodeAddr, mpsc::UnboundedSender<(NodeAddr, Frame)>>>,
}

impl LoopbackMesh {
    pub fn new() -> Arc<LoopbackMesh> {
        Arc::new(LoopbackMesh::default())
    }

    pub fn register(&self, addr: NodeAddr) -> mpsc::UnboundedReceiver<(NodeAddr, Frame)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().insert(addr, tx);
        rx
    }

    pub fn unregister(&self, addr: &NodeAddr) {
        self.inboxes.lock().remove(addr);
    }
}

#[async_trait]
impl FrameTransport for LoopbackMesh {
    async fn send(&self, from: &NodeAddr, to: &NodeAddr, frame: Frame) -> Result<()> {
        let tx = {
            let inboxes = self.inboxes.lock();
            inboxes.get(to).cloned().ok_or(StoreError::NoRoute)?
        };
        tx.send((from.clone(), frame))
            .map_err(|_| StoreError::NoRoute)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use std::time::Duration;

    use super::*;
    use crate::id::ObjectId;
    use crate::wire::{frame_flags, Command};

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    fn reply_frame(trans: u64, more: bool) -> Frame {
        let req = Frame::request(ObjectId::MIN, Command::Write, 0, trans, Bytes::new());
        let extra = if more { frame_flags::MORE } else { 0 };
        Frame::reply(&req.header, 0, extra, Bytes::new())
    }

    #[tokio::test]
    async fn transaction_ids_are_unique() {
        let pool = TransactionPool::new();
        let a = pool.begin();
        let b = pool.begin();
        assert_ne!(a.trans(), b.trans());
    }

    #[tokio::test]
    async fn progress_then_final_completes_transaction() {
        let pool = TransactionPool::new();
        let mut handle = pool.begin();

        pool.complete(reply_frame(handle.trans(), true));
        pool.complete(reply_frame(handle.trans(), false));

        let frames = handle.collect(deadline_in(200)).await.unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].header.has_more());
        assert!(!frames[1].header.has_more());
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn deadline_times_out_and_late_replies_are_dropped() {
        let pool = TransactionPool::new();
        let mut handle = pool.begin();

        let err = handle.recv(deadline_in(20)).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout));

        let trans = handle.trans();
        drop(handle);
        assert_eq!(pool.pending_count(), 0);

        // No entry left; the late frame must be discarded quietly.
        pool.complete(reply_frame(trans, false));
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn loopback_mesh_routes_frames_in_order() {
        let mesh = LoopbackMesh::new();
        let mut inbox = mesh.register("b:1".into());

        for trans in 1..=3u64 {
            let frame =
                Frame::request(ObjectId::MIN, Command::Read, 0, trans, Bytes::new());
            mesh.send(&"a:1".into(), &"b:1".into(), frame).await.unwrap();
        }

        for trans in 1..=3u64 {
            let (from, frame) = inbox.recv().await.unwrap();
            assert_eq!(from, NodeAddr::from("a:1"));
            assert_eq!(frame.header.trans, trans);
        }
    }

    #[tokio::test]
    async fn unknown_peer_is_no_route() {
        let mesh = LoopbackMesh::new();
        let frame = Frame::request(ObjectId::MIN, Command::Read, 0, 1, Bytes::new());
        let err = mesh
            .send(&"a:1".into(), &"nowhere:0".into(), frame)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoRoute));

        mesh.register("c:1".into());
        mesh.unregister(&"c:1".into());
        let frame = Frame::request(ObjectId::MIN, Command::Read, 0, 2, Bytes::new());
        assert!(mesh.send(&"a:1".into(), &"c:1".into(), frame).await.is_err());
    }
}
