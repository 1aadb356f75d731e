//! Per-node in-memory cache tier.
//!
//! A bounded ID-to-blob map with LRU eviction by byte budget. Entries
//! carry an optional TTL deadline, checked on access and by the owning
//! node's periodic sweep, plus a dirty flag for blobs that exist only in
//! the cache (cache-only writes never reach the backend).

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::id::ObjectId;

struct CacheEntry {
    data: Bytes,
    deadline: Option<Instant>,
    dirty: bool,
    tick: u64,
}

struct CacheInner {
    entries: HashMap<ObjectId, CacheEntry>,
    // Lazy LRU: every touch pushes (id, tick); stale pairs are skipped
    // during eviction.
    order: VecDeque<(ObjectId, u64)>,
    used_bytes: u64,
    tick: u64,
}

pub struct CacheTier {
    capacity_bytes: u64,
    inner: Mutex<CacheInner>,
}

impl CacheTier {
    pub fn new(capacity_bytes: u64) -> CacheTier {
        CacheTier {
            capacity_bytes,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                used_bytes: 0,
                tick: 0,
            }),
        }
    }

    /// Insert or replace; `ttl` of zero (or `None`) means no expiry.
    pub fn insert(&self, id: ObjectId, data: Bytes, ttl: Option<Duration>, dirty: bool) {
        let deadline = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| Instant::now() + ttl);

        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(old) = inner.entries.remove(&id) {
            inner.used_bytes -= old.data.len() as u64;
        }
        inner.used_bytes += data.len() as u64;
        inner.entries.insert(id, CacheEntry { data, deadline, dirty, tick });
        inner.order.push_back((id, tick));

        self.evict_over_budget(&mut inner);
    }

    /// Fetch a live entry, refreshing its LRU position. Expired entries
    /// are dropped on the spot.
    pub fn get(&self, id: &ObjectId) -> Option<Bytes> {
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(id) {
            Some(entry) => matches!(entry.deadline, Some(deadline) if deadline <= Instant::now()),
            None => return None,
        };
        if expired {
            Self::drop_entry(&mut inner, id);
            return None;
        }

        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(id).expect("checked above");
        entry.tick = tick;
        let data = entry.data.clone();
        inner.order.push_back((*id, tick));
        Some(data)
    }

    pub fn remove(&self, id: &ObjectId) -> bool {
        let mut inner = self.inner.lock();
        Self::drop_entry(&mut inner, id)
    }

    /// Drop every expired entry; called periodically by the owning node.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<ObjectId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.deadline, Some(deadline) if deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            Self::drop_entry(&mut inner, id);
        }
        if !expired.is_empty() {
            tracing::debug!("cache sweep expired {} entries", expired.len());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    fn drop_entry(inner: &mut CacheInner, id: &ObjectId) -> bool {
        match inner.entries.remove(id) {
            Some(entry) => {
                inner.used_bytes -= entry.data.len() as u64;
                if entry.dirty {
                    tracing::debug!("dropping dirty cache-only entry {}", id);
                }
                true
            }
            None => false,
        }
    }

    fn evict_over_budget(&self, inner: &mut CacheInner) {
        while inner.used_bytes > self.capacity_bytes {
            let Some((id, tick)) = inner.order.pop_front() else {
                break;
            };
            // Stale queue pair: the entry was touched again later.
            let current =
                matches!(inner.entries.get(&id), Some(entry) if entry.tick == tick);
            if current {
                Self::drop_entry(inner, &id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ObjectId {
        ObjectId::transform(format!("cache-{}", n).as_bytes())
    }

    #[test]
    fn insert_get_remove() {
        let cache = CacheTier::new(1024);
        cache.insert(id(1), Bytes::from_static(b"one"), None, false);

        assert_eq!(cache.get(&id(1)).unwrap().as_ref(), b"one");
        assert!(cache.get(&id(2)).is_none());

        assert!(cache.remove(&id(1)));
        assert!(!cache.remove(&id(1)));
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn eviction_follows_recency() {
        // Three 4-byte entries fit, the fourth forces the coldest out.
        let cache = CacheTier::new(12);
        cache.insert(id(1), Bytes::from_static(b"aaaa"), None, false);
        cache.insert(id(2), Bytes::from_static(b"bbbb"), None, false);
        cache.insert(id(3), Bytes::from_static(b"cccc"), None, false);

        // Touch 1 so 2 becomes the eviction candidate.
        cache.get(&id(1));
        cache.insert(id(4), Bytes::from_static(b"dddd"), None, false);

        assert!(cache.get(&id(1)).is_some());
        assert!(cache.get(&id(2)).is_none());
        assert!(cache.get(&id(3)).is_some());
        assert!(cache.get(&id(4)).is_some());
        assert!(cache.used_bytes() <= 12);
    }

    #[test]
    fn replacing_an_entry_updates_the_byte_budget() {
        let cache = CacheTier::new(100);
        cache.insert(id(1), Bytes::from_static(b"0123456789"), None, false);
        cache.insert(id(1), Bytes::from_static(b"xy"), None, false);
        assert_eq!(cache.used_bytes(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_on_access() {
        let cache = CacheTier::new(1024);
        cache.insert(
            id(1),
            Bytes::from_static(b"short-lived"),
            Some(Duration::from_secs(5)),
            false,
        );
        cache.insert(id(2), Bytes::from_static(b"stays"), None, false);

        assert!(cache.get(&id(1)).is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&id(1)).is_none());
        assert!(cache.get(&id(2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_collects_expired_entries() {
        let cache = CacheTier::new(1024);
        for n in 0..10 {
            cache.insert(
                id(n),
                Bytes::from_static(b"x"),
                Some(Duration::from_secs(1)),
                false,
            );
        }
        cache.insert(id(100), Bytes::from_static(b"keep"), None, true);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.sweep();

        assert_eq!(cache.len(), 1);
        assert!(cache.get(&id(100)).is_some());
    }
}
