use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, StoreError};
use crate::id::{ObjectId, ID_LEN};
use crate::io_attr::{io_flags, IoAttr, Timestamp};
use crate::sort::merge_sort;

use super::{Backend, IdRange, Record, RecordIter, RecordSummary};

const RECORD_HEADER_LEN: usize = 8 + 8 + 8 + ID_LEN;
const STAGE_HEADER_LEN: usize = 8;

/// Filesystem backend: one file per record, fanned out by ID prefix.
///
/// Layout under the base directory:
/// `data/{hh}/{id-hex}` for committed records and `stage/{hh}/{id-hex}`
/// for open reservations, where `hh` is the first ID byte in hex. Every
/// write lands in a temp file first and is renamed into place.
///
/// Directory scans return records in storage order, so `iterate` runs the
/// collected index through the in-node merge sort before streaming.
pub struct FsBackend {
    base_path: PathBuf,
    locks: Mutex<HashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FsBackend {
    pub fn new(base_path: PathBuf) -> Result<FsBackend> {
        std::fs::create_dir_all(base_path.join("data"))?;
        std::fs::create_dir_all(base_path.join("stage"))?;
        Ok(FsBackend {
            base_path,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn id_lock(&self, id: &ObjectId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(*id).or_default())
    }

    fn record_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.base_path.join("data").join(&hex[..2]).join(hex)
    }

    fn stage_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.base_path.join("stage").join(&hex[..2]).join(hex)
    }

    async fn load_record(&self, id: &ObjectId) -> Result<Option<(RecordSummary, Bytes)>> {
        match fs::read(self.record_path(id)).await {
            Ok(raw) => decode_record(*id, raw).map(Some),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn store_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn store_record(
        &self,
        attr: &IoAttr,
        data: Vec<u8>,
        written: &[u8],
    ) -> Result<RecordSummary> {
        let summary = RecordSummary {
            id: attr.id,
            size: data.len() as u64,
            user_flags: attr.user_flags,
            timestamp: attr.timestamp.resolve(),
            parent_checksum: ObjectId::transform(written),
        };
        self.store_file(&self.record_path(&attr.id), &encode_record(&summary, &data))
            .await?;
        tracing::debug!("stored record {} ({} bytes)", attr.id, summary.size);
        Ok(summary)
    }

    async fn load_stage(&self, id: &ObjectId) -> Result<Option<(u64, Vec<u8>)>> {
        match fs::read(self.stage_path(id)).await {
            Ok(raw) => {
                if raw.len() < STAGE_HEADER_LEN {
                    return Err(StoreError::Io(std::io::Error::other(format!(
                        "staging file for {} is corrupt",
                        id
                    ))));
                }
                let mut header = &raw[..STAGE_HEADER_LEN];
                let high_water = header.get_u64_le();
                Ok(Some((high_water, raw[STAGE_HEADER_LEN..].to_vec())))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn store_stage(&self, id: &ObjectId, high_water: u64, buffer: &[u8]) -> Result<()> {
        let mut contents = BytesMut::with_capacity(STAGE_HEADER_LEN + buffer.len());
        contents.put_u64_le(high_water);
        contents.put_slice(buffer);
        self.store_file(&self.stage_path(id), &contents).await
    }

    /// All committed record IDs within `range`, sorted.
    async fn scan_ids(&self, range: &IdRange) -> Result<Vec<ObjectId>> {
        let mut packed = Vec::new();
        let mut count = 0usize;

        let data_dir = self.base_path.join("data");
        let mut shards = fs::read_dir(&data_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Ok(id) = ObjectId::from_hex(name) else { continue };
                if range.contains(&id) {
                    packed.extend_from_slice(id.as_bytes());
                    count += 1;
                }
            }
        }

        let mut scratch = vec![0u8; count * ID_LEN + std::mem::size_of::<usize>()];
        merge_sort(&mut packed, count, ID_LEN, &mut scratch, |a, b| a.cmp(b))?;

        Ok(packed
            .chunks(ID_LEN)
            .filter_map(|chunk| ObjectId::from_slice(chunk).ok())
            .collect())
    }
}

fn encode_record(summary: &RecordSummary, data: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(RECORD_HEADER_LEN + data.len());
    out.put_u64_le(summary.user_flags);
    out.put_i64_le(summary.timestamp.sec);
    out.put_i64_le(summary.timestamp.nsec);
    out.put_slice(summary.parent_checksum.as_bytes());
    out.put_slice(data);
    out.to_vec()
}

fn decode_record(id: ObjectId, raw: Vec<u8>) -> Result<(RecordSummary, Bytes)> {
    if raw.len() < RECORD_HEADER_LEN {
        return Err(StoreError::Io(std::io::Error::other(format!(
            "record file for {} is corrupt",
            id
        ))));
    }

    let mut header = &raw[..RECORD_HEADER_LEN];
    let user_flags = header.get_u64_le();
    let sec = header.get_i64_le();
    let nsec = header.get_i64_le();
    let mut parent = [0u8; ID_LEN];
    header.copy_to_slice(&mut parent);

    let data = Bytes::copy_from_slice(&raw[RECORD_HEADER_LEN..]);
    let summary = RecordSummary {
        id,
        size: data.len() as u64,
        user_flags,
        timestamp: Timestamp { sec, nsec },
        parent_checksum: ObjectId(parent),
    };
    Ok((summary, data))
}

fn check_cas(attr: &IoAttr, existing: Option<&RecordSummary>) -> Result<()> {
    if attr.flags & io_flags::COMPARE_AND_SWAP != 0 {
        if let Some(summary) = existing {
            if summary.parent_checksum != attr.parent {
                return Err(StoreError::CasMismatch);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Backend for FsBackend {
    async fn read(&self, id: &ObjectId, offset: u64, size: u64) -> Result<Record> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let (summary, data) = self.load_record(id).await?.ok_or(StoreError::NotFound)?;
        let len = data.len() as u64;
        if offset > len {
            return Err(StoreError::InvalidArgument(format!(
                "read offset {} beyond record size {}",
                offset, len
            )));
        }
        let available = len - offset;
        let n = if size == 0 { available } else { size.min(available) };

        Ok(Record {
            summary,
            data: data.slice(offset as usize..(offset + n) as usize),
        })
    }

    async fn write(&self, attr: &IoAttr, data: Bytes) -> Result<RecordSummary> {
        let lock = self.id_lock(&attr.id);
        let _guard = lock.lock().await;

        let existing = self.load_record(&attr.id).await?;
        check_cas(attr, existing.as_ref().map(|(summary, _)| summary))?;

        let offset = attr.offset as usize;
        let mut merged = Vec::with_capacity(offset + data.len());
        if let Some((_, old)) = &existing {
            merged.extend_from_slice(&old[..old.len().min(offset)]);
        }
        merged.resize(offset, 0);
        merged.extend_from_slice(&data);

        self.store_record(attr, merged, &data).await
    }

    async fn append(&self, attr: &IoAttr, data: Bytes) -> Result<RecordSummary> {
        let lock = self.id_lock(&attr.id);
        let _guard = lock.lock().await;

        let existing = self.load_record(&attr.id).await?;
        check_cas(attr, existing.as_ref().map(|(summary, _)| summary))?;

        let mut merged = existing.map(|(_, old)| old.to_vec()).unwrap_or_default();
        merged.extend_from_slice(&data);

        self.store_record(attr, merged, &data).await
    }

    async fn remove(&self, id: &ObjectId) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        match fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn lookup(&self, id: &ObjectId) -> Result<RecordSummary> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        self.load_record(id)
            .await?
            .map(|(summary, _)| summary)
            .ok_or(StoreError::NotFound)
    }

    async fn iterate(&self, range: IdRange) -> Result<RecordIter> {
        let ids = self.scan_ids(&range).await?;
        let (tx, iter) = RecordIter::channel();

        let base_path = self.base_path.clone();
        tokio::spawn(async move {
            for id in ids {
                let hex = id.to_hex();
                let path = base_path.join("data").join(&hex[..2]).join(hex);
                let record = match fs::read(path).await {
                    Ok(raw) => match decode_record(id, raw) {
                        Ok((summary, data)) => Record { summary, data },
                        Err(error) => {
                            tracing::warn!("skipping corrupt record {}: {}", id, error);
                            continue;
                        }
                    },
                    // Removed between the scan and the read.
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(error) => {
                        tracing::warn!("failed to read record {}: {}", id, error);
                        continue;
                    }
                };

                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });

        Ok(iter)
    }

    async fn prepare(&self, id: &ObjectId, reserve_size: u64) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        self.store_stage(id, 0, &vec![0u8; reserve_size as usize])
            .await
    }

    async fn plain_write(&self, id: &ObjectId, offset: u64, data: Bytes) -> Result<()> {
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        let (mut high_water, mut buffer) =
            self.load_stage(id).await?.unwrap_or((0, Vec::new()));

        let end = offset + data.len() as u64;
        if buffer.len() < end as usize {
            buffer.resize(end as usize, 0);
        }
        buffer[offset as usize..end as usize].copy_from_slice(&data);
        high_water = high_water.max(end);

        self.store_stage(id, high_water, &buffer).await
    }

    async fn commit(&self, attr: &IoAttr, final_size: u64) -> Result<RecordSummary> {
        let lock = self.id_lock(&attr.id);
        let _guard = lock.lock().await;

        let (high_water, mut buffer) = self
            .load_stage(&attr.id)
            .await?
            .unwrap_or((0, Vec::new()));

        if final_size < high_water {
            return Err(StoreError::InvalidArgument(format!(
                "commit size {} below staged extent {}",
                final_size, high_water
            )));
        }
        buffer.resize(final_size as usize, 0);

        let summary = RecordSummary {
            id: attr.id,
            size: final_size,
            user_flags: attr.user_flags,
            timestamp: attr.timestamp.resolve(),
            parent_checksum: ObjectId::transform(&buffer),
        };
        self.store_file(&self.record_path(&attr.id), &encode_record(&summary, &buffer))
            .await?;

        match fs::remove_file(self.stage_path(&attr.id)).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        Ok(summary)
    }
}
