use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::id::ObjectId;
use crate::io_attr::{io_flags, IoAttr, Timestamp};

use super::{Backend, IdRange, Record, RecordIter, RecordSummary};

#[derive(Debug, Clone)]
struct Stored {
    data: Vec<u8>,
    user_flags: u64,
    timestamp: Timestamp,
    parent_checksum: ObjectId,
}

#[derive(Debug, Clone, Default)]
struct Staging {
    data: Vec<u8>,
    high_water: u64,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    record: Option<Stored>,
    staging: Option<Staging>,
}

/// Ordered in-memory backend.
///
/// One lock over the whole map: every operation is short and same-ID
/// linearization falls out for free.
#[derive(Default)]
pub struct MemoryBackend {
    slots: Mutex<BTreeMap<ObjectId, Slot>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    fn check_cas(attr: &IoAttr, existing: Option<&Stored>) -> Result<()> {
        if attr.flags & io_flags::COMPARE_AND_SWAP != 0 {
            if let Some(stored) = existing {
                if stored.parent_checksum != attr.parent {
                    return Err(StoreError::CasMismatch);
                }
            }
        }
        Ok(())
    }

    fn stored_from(attr: &IoAttr, data: Vec<u8>, written: &[u8]) -> Stored {
        Stored {
            data,
            user_flags: attr.user_flags,
            timestamp: attr.timestamp.resolve(),
            parent_checksum: ObjectId::transform(written),
        }
    }
}

fn summary_of(id: ObjectId, stored: &Stored) -> RecordSummary {
    RecordSummary {
        id,
        size: stored.data.len() as u64,
        user_flags: stored.user_flags,
        timestamp: stored.timestamp,
        parent_checksum: stored.parent_checksum,
    }
}

fn read_slice(data: &[u8], offset: u64, size: u64) -> Result<Bytes> {
    let len = data.len() as u64;
    if offset > len {
        return Err(StoreError::InvalidArgument(format!(
            "read offset {} beyond record size {}",
            offset, len
        )));
    }
    let available = len - offset;
    let n = if size == 0 { available } else { size.min(available) };
    Ok(Bytes::copy_from_slice(
        &data[offset as usize..(offset + n) as usize],
    ))
}

/// Prefix-keep overwrite: `old[..offset]` (zero-padded) + `data`.
fn overlay(old: Option<&[u8]>, offset: u64, data: &[u8]) -> Vec<u8> {
    let offset = offset as usize;
    let mut out = Vec::with_capacity(offset + data.len());
    if let Some(old) = old {
        out.extend_from_slice(&old[..old.len().min(offset)]);
    }
    out.resize(offset, 0);
    out.extend_from_slice(data);
    out
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn read(&self, id: &ObjectId, offset: u64, size: u64) -> Result<Record> {
        let slots = self.slots.lock();
        let stored = slots
            .get(id)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(StoreError::NotFound)?;

        Ok(Record {
            summary: summary_of(*id, stored),
            data: read_slice(&stored.data, offset, size)?,
        })
    }

    async fn write(&self, attr: &IoAttr, data: Bytes) -> Result<RecordSummary> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(attr.id).or_default();
        Self::check_cas(attr, slot.record.as_ref())?;

        let merged = overlay(
            slot.record.as_ref().map(|r| r.data.as_slice()),
            attr.offset,
            &data,
        );
        let stored = Self::stored_from(attr, merged, &data);
        let summary = summary_of(attr.id, &stored);
        slot.record = Some(stored);
        Ok(summary)
    }

    async fn append(&self, attr: &IoAttr, data: Bytes) -> Result<RecordSummary> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(attr.id).or_default();
        Self::check_cas(attr, slot.record.as_ref())?;

        let mut merged = slot
            .record
            .as_ref()
            .map(|r| r.data.clone())
            .unwrap_or_default();
        merged.extend_from_slice(&data);

        let stored = Self::stored_from(attr, merged, &data);
        let summary = summary_of(attr.id, &stored);
        slot.record = Some(stored);
        Ok(summary)
    }

    async fn remove(&self, id: &ObjectId) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(id) {
            Some(slot) if slot.record.is_some() => {
                slot.record = None;
                if slot.staging.is_none() {
                    slots.remove(id);
                }
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn lookup(&self, id: &ObjectId) -> Result<RecordSummary> {
        let slots = self.slots.lock();
        slots
            .get(id)
            .and_then(|slot| slot.record.as_ref())
            .map(|stored| summary_of(*id, stored))
            .ok_or(StoreError::NotFound)
    }

    async fn iterate(&self, range: IdRange) -> Result<RecordIter> {
        if range.end < range.begin {
            return Err(StoreError::InvalidArgument(format!(
                "range end {} precedes begin {}",
                range.end, range.begin
            )));
        }

        let records: Vec<Record> = {
            let slots = self.slots.lock();
            slots
                .range((Bound::Included(range.begin), Bound::Excluded(range.end)))
                .filter_map(|(id, slot)| {
                    slot.record.as_ref().map(|stored| Record {
                        summary: summary_of(*id, stored),
                        data: Bytes::copy_from_slice(&stored.data),
                    })
                })
                .collect()
        };
        Ok(RecordIter::from_records(records))
    }

    async fn prepare(&self, id: &ObjectId, reserve_size: u64) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(*id).or_default();
        slot.staging = Some(Staging {
            data: vec![0; reserve_size as usize],
            high_water: 0,
        });
        Ok(())
    }

    async fn plain_write(&self, id: &ObjectId, offset: u64, data: Bytes) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(*id).or_default();
        let staging = slot.staging.get_or_insert_with(Staging::default);

        let end = offset + data.len() as u64;
        if staging.data.len() < end as usize {
            staging.data.resize(end as usize, 0);
        }
        staging.data[offset as usize..end as usize].copy_from_slice(&data);
        staging.high_water = staging.high_water.max(end);
        Ok(())
    }

    async fn commit(&self, attr: &IoAttr, final_size: u64) -> Result<RecordSummary> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(attr.id).or_default();
        let staging = slot.staging.take().unwrap_or_default();

        if final_size < staging.high_water {
            let high_water = staging.high_water;
            slot.staging = Some(staging);
            return Err(StoreError::InvalidArgument(format!(
                "commit size {} below staged extent {}",
                final_size, high_water
            )));
        }

        let mut data = staging.data;
        data.resize(final_size as usize, 0);

        let stored = Stored {
            user_flags: attr.user_flags,
            timestamp: attr.timestamp.resolve(),
            parent_checksum: ObjectId::transform(&data),
            data,
        };
        let summary = summary_of(attr.id, &stored);
        slot.record = Some(stored);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(key: &[u8]) -> IoAttr {
        IoAttr::new(ObjectId::transform(key))
    }

    #[tokio::test]
    async fn write_replaces_from_offset_and_keeps_prefix() {
        let backend = MemoryBackend::new();
        let attr0 = attr(b"overlay");

        backend.write(&attr0, Bytes::from_static(b"55555")).await.unwrap();

        let mut attr1 = attr0;
        attr1.offset = 1;
        backend.write(&attr1, Bytes::from_static(b"43210")).await.unwrap();

        let record = backend.read(&attr0.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"543210");

        // Rewrite at offset zero truncates the old tail.
        backend.write(&attr0, Bytes::from_static(b"xy")).await.unwrap();
        let record = backend.read(&attr0.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"xy");
    }

    #[tokio::test]
    async fn sparse_write_zero_pads_the_gap() {
        let backend = MemoryBackend::new();
        let mut a = attr(b"sparse");
        a.offset = 4;
        backend.write(&a, Bytes::from_static(b"zz")).await.unwrap();

        let record = backend.read(&a.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"\0\0\0\0zz");
    }

    #[tokio::test]
    async fn read_offsets_and_sizes() {
        let backend = MemoryBackend::new();
        let a = attr(b"ranges");
        backend.write(&a, Bytes::from_static(b"543210")).await.unwrap();

        assert_eq!(backend.read(&a.id, 3, 0).await.unwrap().data.as_ref(), b"210");
        assert_eq!(backend.read(&a.id, 2, 1).await.unwrap().data.as_ref(), b"3");
        assert!(backend.read(&a.id, 7, 0).await.is_err());
        assert!(matches!(
            backend.read(&ObjectId::transform(b"absent"), 0, 0).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn cas_guards_against_stale_checksums() {
        let backend = MemoryBackend::new();
        let a = attr(b"cas");
        backend.write(&a, Bytes::from_static(b"first")).await.unwrap();

        let mut swap = a;
        swap.flags = io_flags::COMPARE_AND_SWAP;
        swap.parent = ObjectId::transform(b"first");
        backend.write(&swap, Bytes::from_static(b"second")).await.unwrap();

        // Same expected checksum is stale now.
        let result = backend.write(&swap, Bytes::from_static(b"third")).await;
        assert!(matches!(result, Err(StoreError::CasMismatch)));
        assert_eq!(
            backend.read(&a.id, 0, 0).await.unwrap().data.as_ref(),
            b"second"
        );
    }

    #[tokio::test]
    async fn prepared_data_is_invisible_until_commit() {
        let backend = MemoryBackend::new();
        let a = attr(b"staged");

        backend.prepare(&a.id, 1024).await.unwrap();
        backend
            .plain_write(&a.id, 0, Bytes::from_static(b"part0|"))
            .await
            .unwrap();
        backend
            .plain_write(&a.id, 6, Bytes::from_static(b"part1|"))
            .await
            .unwrap();

        assert!(matches!(
            backend.read(&a.id, 0, 0).await,
            Err(StoreError::NotFound)
        ));
        assert!(backend.lookup(&a.id).await.is_err());

        // Too-small final size is rejected and keeps the staging open.
        assert!(backend.commit(&a, 5).await.is_err());

        let summary = backend.commit(&a, 12).await.unwrap();
        assert_eq!(summary.size, 12);

        let record = backend.read(&a.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"part0|part1|");
        assert_eq!(record.summary.parent_checksum, ObjectId::transform(b"part0|part1|"));
    }

    #[tokio::test]
    async fn commit_without_prepare_creates_the_record() {
        let backend = MemoryBackend::new();
        let a = attr(b"direct-commit");

        backend
            .plain_write(&a.id, 0, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        backend.commit(&a, 7).await.unwrap();

        let record = backend.read(&a.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn prepare_keeps_previous_record_readable() {
        let backend = MemoryBackend::new();
        let a = attr(b"pre-existing");
        backend.write(&a, Bytes::from_static(b"old")).await.unwrap();

        backend.prepare(&a.id, 64).await.unwrap();
        backend
            .plain_write(&a.id, 0, Bytes::from_static(b"new!"))
            .await
            .unwrap();

        let record = backend.read(&a.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"old");

        backend.commit(&a, 4).await.unwrap();
        let record = backend.read(&a.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"new!");
    }

    #[tokio::test]
    async fn iterate_returns_range_in_id_order() {
        let backend = MemoryBackend::new();

        let mut ids = Vec::new();
        for i in 0..16u8 {
            let mut raw = [0x13u8; crate::id::ID_LEN];
            raw[crate::id::ID_LEN - 1] = i;
            let id = ObjectId(raw);
            ids.push(id);
            backend
                .write(&IoAttr::new(id), Bytes::from(format!("record-{}", i)))
                .await
                .unwrap();
        }

        let mut end = [0x13u8; crate::id::ID_LEN];
        end[crate::id::ID_LEN - 1] = 16;
        let iter = backend
            .iterate(IdRange { begin: ids[0], end: ObjectId(end) })
            .await
            .unwrap();
        let records = iter.collect().await;

        assert_eq!(records.len(), 16);
        for window in records.windows(2) {
            assert!(window[0].summary.id < window[1].summary.id);
        }
    }

    #[tokio::test]
    async fn remove_is_not_found_twice() {
        let backend = MemoryBackend::new();
        let a = attr(b"gone");
        backend.write(&a, Bytes::from_static(b"x")).await.unwrap();

        backend.remove(&a.id).await.unwrap();
        assert!(matches!(backend.remove(&a.id).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn append_concatenates() {
        let backend = MemoryBackend::new();
        let a = attr(b"appendable");
        backend.write(&a, Bytes::from_static(b"first")).await.unwrap();
        backend.append(&a, Bytes::from_static(b"|second")).await.unwrap();

        let record = backend.read(&a.id, 0, 0).await.unwrap();
        assert_eq!(record.data.as_ref(), b"first|second");
    }
}
