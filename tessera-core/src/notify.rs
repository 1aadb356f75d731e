//! Per-node write-notification registry.
//!
//! Subscriptions live in a fixed set of hash buckets, each guarded by its
//! own readers-writer lock: publication takes the read side, add/remove
//! take the write side. Observer handles are refcounted, so publication
//! clones them out of the bucket and emits events after the lock is gone.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, StoreError};
use crate::id::ObjectId;
use crate::io_attr::IoAttr;
use crate::routing::NodeAddr;

/// Delivered to every subscriber of an ID when that ID is written.
#[derive(Debug, Clone)]
pub struct NotifyEvent {
    pub io_attr: IoAttr,
    pub origin: NodeAddr,
}

/// Receiving side of a subscription.
///
/// Both callbacks must not block: transports that might are expected to
/// hand the event off to their own writer task.
pub trait NotifyObserver: Send + Sync {
    fn notify(&self, event: NotifyEvent);

    /// Terminating reply; called exactly once, when the subscription is
    /// removed or the node shuts down.
    fn closed(&self);
}

struct NotifyEntry {
    id: ObjectId,
    observer: Arc<dyn NotifyObserver>,
}

pub struct NotifyRegistry {
    buckets: Vec<RwLock<Vec<NotifyEntry>>>,
}

impl NotifyRegistry {
    /// Bucket count is fixed for the registry's lifetime.
    pub fn new(bucket_count: usize) -> Result<NotifyRegistry> {
        if bucket_count == 0 {
            return Err(StoreError::InvalidArgument(
                "notify registry needs at least one bucket".to_string(),
            ));
        }

        let mut buckets = Vec::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            buckets.push(RwLock::new(Vec::new()));
        }
        Ok(NotifyRegistry { buckets })
    }

    fn bucket(&self, id: &ObjectId) -> &RwLock<Vec<NotifyEntry>> {
        &self.buckets[hash_id(id) as usize % self.buckets.len()]
    }

    pub fn add(&self, id: ObjectId, observer: Arc<dyn NotifyObserver>) {
        let mut bucket = self.bucket(&id).write();
        bucket.push(NotifyEntry { id, observer });
        tracing::debug!("added notification for {}", id);
    }

    /// Unlink the first subscription matching `id`; the observer gets its
    /// terminating reply and is released.
    pub fn remove(&self, id: &ObjectId) -> Result<()> {
        let mut bucket = self.bucket(id).write();
        let position = bucket.iter().position(|entry| entry.id == *id);
        match position {
            Some(index) => {
                let entry = bucket.remove(index);
                entry.observer.closed();
                tracing::debug!("removed notification for {}", id);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Best-effort delivery to every subscriber of `id`.
    ///
    /// Handles are cloned out under the read lock and events emitted after
    /// it is released, so a slow transport never stalls mutation.
    pub fn publish(&self, id: &ObjectId, io_attr: IoAttr, origin: NodeAddr) {
        let observers: Vec<Arc<dyn NotifyObserver>> = {
            let bucket = self.bucket(id).read();
            bucket
                .iter()
                .filter(|entry| entry.id == *id)
                .map(|entry| Arc::clone(&entry.observer))
                .collect()
        };

        if observers.is_empty() {
            return;
        }

        tracing::debug!("publishing write on {} to {} observers", id, observers.len());
        let event = NotifyEvent { io_attr, origin };
        for observer in observers {
            observer.notify(event.clone());
        }
    }

    /// Drain every bucket, closing each remaining subscription.
    pub fn shutdown(&self) {
        for bucket in &self.buckets {
            let drained: Vec<NotifyEntry> = bucket.write().drain(..).collect();
            for entry in drained {
                entry.observer.closed();
            }
        }
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.read().len()).sum()
    }
}

/// Wire form of a notification event: the IO attributes followed by the
/// length-prefixed origin address.
pub mod notify_payload {
    use bytes::{Buf, BufMut, Bytes, BytesMut};

    use super::NotifyEvent;
    use crate::error::{Result, StoreError};
    use crate::io_attr::{IoAttr, IO_ATTR_WIRE_LEN};
    use crate::routing::NodeAddr;

    pub fn encode(event: &NotifyEvent) -> Bytes {
        let addr = event.origin.as_str().as_bytes();
        let mut buf = BytesMut::with_capacity(IO_ATTR_WIRE_LEN + 4 + addr.len());
        event.io_attr.encode(&mut buf);
        buf.put_u32_le(addr.len() as u32);
        buf.put_slice(addr);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<NotifyEvent> {
        let io_attr = IoAttr::decode(&mut payload)?;
        if payload.remaining() < 4 {
            return Err(StoreError::InvalidArgument(
                "notification payload missing origin length".to_string(),
            ));
        }
        let len = payload.get_u32_le() as usize;
        if payload.remaining() < len {
            return Err(StoreError::InvalidArgument(
                "notification payload missing origin address".to_string(),
            ));
        }
        let addr = std::str::from_utf8(&payload[..len])
            .map_err(|_| {
                StoreError::InvalidArgument("origin address is not utf-8".to_string())
            })?
            .to_string();
        Ok(NotifyEvent { io_attr, origin: NodeAddr::from(addr) })
    }
}

/// XOR-fold the ID into a 32-bit accumulator.
fn hash_id(id: &ObjectId) -> u32 {
    let mut hash: u32 = 0xbb40e64d;
    for chunk in id.as_bytes().chunks(4) {
        hash ^= u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    hash
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::id::ID_LEN;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<NotifyEvent>>,
        closes: AtomicUsize,
    }

    impl NotifyObserver for RecordingObserver {
        fn notify(&self, event: NotifyEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn closed(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> NotifyRegistry {
        NotifyRegistry::new(16).unwrap()
    }

    #[test]
    fn publish_reaches_every_matching_subscriber() {
        let registry = registry();
        let id = ObjectId::transform(b"watched");
        let other = ObjectId::transform(b"other");

        let a = Arc::new(RecordingObserver::default());
        let b = Arc::new(RecordingObserver::default());
        let c = Arc::new(RecordingObserver::default());
        registry.add(id, a.clone());
        registry.add(id, b.clone());
        registry.add(other, c.clone());

        registry.publish(&id, IoAttr::new(id), NodeAddr::from("origin:1025"));

        assert_eq!(a.events.lock().unwrap().len(), 1);
        assert_eq!(b.events.lock().unwrap().len(), 1);
        assert!(c.events.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_unlinks_one_subscription_and_closes_it_once() {
        let registry = registry();
        let id = ObjectId::transform(b"twice");

        let a = Arc::new(RecordingObserver::default());
        let b = Arc::new(RecordingObserver::default());
        registry.add(id, a.clone());
        registry.add(id, b.clone());

        registry.remove(&id).unwrap();
        assert_eq!(registry.subscription_count(), 1);

        // The first entry went away; one close, no further notifications.
        registry.publish(&id, IoAttr::new(id), NodeAddr::from("origin:1025"));
        assert_eq!(
            a.closes.load(Ordering::SeqCst) + b.closes.load(Ordering::SeqCst),
            1
        );
        assert_eq!(
            a.events.lock().unwrap().len() + b.events.lock().unwrap().len(),
            1
        );

        registry.remove(&id).unwrap();
        assert!(matches!(registry.remove(&id), Err(StoreError::NotFound)));
    }

    #[test]
    fn shutdown_closes_everything_exactly_once() {
        let registry = registry();
        let observers: Vec<Arc<RecordingObserver>> = (0..32)
            .map(|i| {
                let observer = Arc::new(RecordingObserver::default());
                let id = ObjectId::transform(format!("sub-{}", i).as_bytes());
                registry.add(id, observer.clone());
                observer
            })
            .collect();

        registry.shutdown();
        registry.shutdown();

        assert_eq!(registry.subscription_count(), 0);
        for observer in observers {
            assert_eq!(observer.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn ids_spread_over_buckets() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let id = ObjectId::transform(format!("spread-{}", i).as_bytes());
            seen.insert(hash_id(&id) % 16);
        }
        assert!(seen.len() > 4);
    }

    #[test]
    fn zero_buckets_is_rejected() {
        assert!(NotifyRegistry::new(0).is_err());
    }

    #[test]
    fn hash_folds_the_whole_id() {
        let mut a = [0u8; ID_LEN];
        let mut b = [0u8; ID_LEN];
        // Differ only in the last word.
        a[ID_LEN - 1] = 1;
        b[ID_LEN - 1] = 2;
        assert_ne!(hash_id(&ObjectId(a)), hash_id(&ObjectId(b)));
    }
}
