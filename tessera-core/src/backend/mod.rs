use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::id::ObjectId;
use crate::io_attr::{IoAttr, Timestamp};

mod fs;
mod memory;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

/// Metadata of a committed record, without its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSummary {
    pub id: ObjectId,
    pub size: u64,
    pub user_flags: u64,
    pub timestamp: Timestamp,
    pub parent_checksum: ObjectId,
}

impl RecordSummary {
    /// Project the summary into response IO attributes.
    pub fn to_io_attr(&self) -> IoAttr {
        IoAttr::builder(self.id)
            .parent(self.parent_checksum)
            .user_flags(self.user_flags)
            .timestamp(self.timestamp)
            .size(self.size)
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub summary: RecordSummary,
    pub data: Bytes,
}

/// Half-open ID interval `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub begin: ObjectId,
    pub end: ObjectId,
}

impl IdRange {
    pub fn contains(&self, id: &ObjectId) -> bool {
        *id >= self.begin && *id < self.end
    }
}

/// Finite, ID-ordered, non-restartable record sequence.
pub struct RecordIter {
    rx: mpsc::Receiver<Record>,
}

impl RecordIter {
    const FEED_DEPTH: usize = 64;

    pub fn from_records(records: Vec<Record>) -> RecordIter {
        let (tx, rx) = mpsc::channel(Self::FEED_DEPTH.max(1));
        tokio::spawn(async move {
            for record in records {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        RecordIter { rx }
    }

    pub fn channel() -> (mpsc::Sender<Record>, RecordIter) {
        let (tx, rx) = mpsc::channel(Self::FEED_DEPTH);
        (tx, RecordIter { rx })
    }

    pub async fn next(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    pub async fn collect(mut self) -> Vec<Record> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        records
    }
}

/// Capabilities the core expects from a persistent blob store.
///
/// Implementations are thread-safe and linearize operations on the same
/// ID; a prepared-but-uncommitted reservation stays invisible to `read`,
/// `lookup` and `iterate` until `commit`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `size == 0` reads to the end of the record.
    async fn read(&self, id: &ObjectId, offset: u64, size: u64) -> Result<Record>;

    /// Plain write: keeps the record's first `attr.offset` bytes
    /// (zero-padding a shorter record) and replaces everything after them.
    /// Honors the compare-and-swap flag against `attr.parent`.
    async fn write(&self, attr: &IoAttr, data: Bytes) -> Result<RecordSummary>;

    /// Concatenate to the current end, ignoring the caller offset.
    async fn append(&self, attr: &IoAttr, data: Bytes) -> Result<RecordSummary>;

    async fn remove(&self, id: &ObjectId) -> Result<()>;

    async fn lookup(&self, id: &ObjectId) -> Result<RecordSummary>;

    async fn iterate(&self, range: IdRange) -> Result<RecordIter>;

    /// Open a reservation of `reserve_size` bytes for `id`.
    async fn prepare(&self, id: &ObjectId, reserve_size: u64) -> Result<()>;

    /// Write into the reservation (creating one sized to the write if
    /// none is open); the record stays invisible.
    async fn plain_write(&self, id: &ObjectId, offset: u64, data: Bytes) -> Result<()>;

    /// Close the reservation at `final_size` bytes and make the record
    /// visible. Fails when `final_size` is below the highest staged
    /// offset.
    async fn commit(&self, attr: &IoAttr, final_size: u64) -> Result<RecordSummary>;
}
