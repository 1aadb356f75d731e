//! Client-side orchestration over a node's transport.
//!
//! A session is a configured lens over a [`Node`]: an ordered group list,
//! command and IO flag bits, a timeout and an error policy. Multi-group
//! operations collect per-group outcomes instead of short-circuiting; an
//! operation fails overall only when no group succeeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::dispatch::{encode_io_attr, encode_record_payload, split_io_payload, NOTIFY_DROP};
use crate::error::{Result, StoreError};
use crate::id::{GroupId, ObjectId};
use crate::index::{FindIndexResult, FindMode, IndexFindRequest, IndexSetRequest, TagPayload};
use crate::io_attr::{io_flags, IoAttr, IO_ATTR_WIRE_LEN};
use crate::node::Node;
use crate::notify::{notify_payload, NotifyEvent};
use crate::routing::NodeAddr;
use crate::wire::{frame_flags, Command, Frame};

/// How aggregate failures surface to the caller.
///
/// `Strict` turns an operation that succeeded on no group into an error;
/// `Lenient` always hands back the result set for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    #[default]
    Strict,
    Lenient,
}

/// One response frame of a write-class operation, tagged with the group
/// it came from.
#[derive(Debug, Clone)]
pub struct WriteEntry {
    pub group: GroupId,
    pub status: i32,
    pub is_ack: bool,
    pub io_attr: Option<IoAttr>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    entries: Vec<WriteEntry>,
}

impl WriteResult {
    pub fn entries(&self) -> &[WriteEntry] {
        &self.entries
    }

    /// Final successful responses; progress acks do not count.
    pub fn success_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == 0 && !entry.is_ack)
            .count()
    }

    pub fn is_ok(&self) -> bool {
        self.success_count() > 0
    }

    /// The error representing the whole result set, if every group failed.
    pub fn error(&self) -> Option<StoreError> {
        if self.is_ok() {
            return None;
        }
        let errors: Vec<StoreError> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_ack && entry.status < 0)
            .map(|entry| StoreError::from_wire_code(entry.status))
            .collect();
        Some(representative_error(errors))
    }
}

#[derive(Debug, Clone)]
pub struct ReadResult {
    pub group: GroupId,
    pub io_attr: IoAttr,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct LookupResult {
    pub group: GroupId,
    pub io_attr: IoAttr,
}

#[derive(Debug, Clone)]
pub struct BulkReadEntry {
    pub group: GroupId,
    pub io_attr: IoAttr,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct RangeEntry {
    pub io_attr: IoAttr,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    pub entries: Vec<RangeEntry>,
}

impl RangeResult {
    /// Sum of removal counts over all responses.
    pub fn total_removed(&self) -> u64 {
        self.entries.iter().map(|entry| entry.io_attr.num).sum()
    }
}

/// Live notification subscription; see [`Session::request_notification`].
pub struct NotifyStream {
    handle: crate::transport::TransactionHandle,
}

impl NotifyStream {
    /// Next event, or `None` once the subscription's terminating reply
    /// arrives.
    pub async fn next(&mut self, timeout: Duration) -> Result<Option<NotifyEvent>> {
        let frame = self.handle.recv(Instant::now() + timeout).await?;
        if !frame.header.has_more() {
            return Ok(None);
        }
        notify_payload::decode(frame.payload).map(Some)
    }
}

#[derive(Clone)]
pub struct Session {
    node: Arc<Node>,
    groups: Vec<GroupId>,
    cflags: u64,
    ioflags: u32,
    timeout: Duration,
    policy: ErrorPolicy,
    transform: fn(&[u8]) -> ObjectId,
}

impl Session {
    pub fn new(node: Arc<Node>) -> Session {
        let timeout = node.wait_timeout();
        Session {
            node,
            groups: Vec::new(),
            cflags: 0,
            ioflags: 0,
            timeout,
            policy: ErrorPolicy::default(),
            transform: ObjectId::transform,
        }
    }

    pub fn set_groups(mut self, groups: Vec<GroupId>) -> Session {
        self.groups = groups;
        self
    }

    pub fn groups(&self) -> &[GroupId] {
        &self.groups
    }

    pub fn set_cflags(mut self, cflags: u64) -> Session {
        self.cflags = cflags;
        self
    }

    pub fn set_ioflags(mut self, ioflags: u32) -> Session {
        self.ioflags = ioflags;
        self
    }

    pub fn ioflags(&self) -> u32 {
        self.ioflags
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Session {
        self.timeout = timeout;
        self
    }

    pub fn set_error_policy(mut self, policy: ErrorPolicy) -> Session {
        self.policy = policy;
        self
    }

    pub fn set_transform(mut self, transform: fn(&[u8]) -> ObjectId) -> Session {
        self.transform = transform;
        self
    }

    /// Hash a key into the session's ID space.
    pub fn transform(&self, key: impl AsRef<[u8]>) -> ObjectId {
        (self.transform)(key.as_ref())
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    fn request_flags(&self, extra: u32) -> u32 {
        self.cflags as u32 | extra
    }

    fn base_attr(&self, id: ObjectId) -> IoAttr {
        IoAttr::builder(id).flags(self.ioflags).build()
    }

    // ── plain and flagged writes ────────────────────────────────────────

    pub async fn write_data(
        &self,
        key: impl AsRef<[u8]>,
        data: impl Into<Bytes>,
        offset: u64,
    ) -> Result<WriteResult> {
        self.write_data_id(self.transform(key), data, offset).await
    }

    pub async fn write_data_id(
        &self,
        id: ObjectId,
        data: impl Into<Bytes>,
        offset: u64,
    ) -> Result<WriteResult> {
        let mut attr = self.base_attr(id);
        attr.offset = offset;
        self.fan_out_write(Command::Write, attr, data.into()).await
    }

    /// Compare-and-swap: the write goes through only while the stored
    /// record's checksum still equals `expected`. Mismatches are not
    /// retried.
    pub async fn write_cas(
        &self,
        key: impl AsRef<[u8]>,
        data: impl Into<Bytes>,
        expected: ObjectId,
        offset: u64,
    ) -> Result<WriteResult> {
        let mut attr = self.base_attr(self.transform(key));
        attr.offset = offset;
        attr.parent = expected;
        attr.flags |= io_flags::COMPARE_AND_SWAP;
        self.fan_out_write(Command::Write, attr, data.into()).await
    }

    /// Reserve `reserve_total` bytes and stage the first chunk; nothing
    /// becomes readable before [`Session::write_commit`].
    pub async fn write_prepare(
        &self,
        key: impl AsRef<[u8]>,
        data: impl Into<Bytes>,
        offset: u64,
        reserve_total: u64,
    ) -> Result<WriteResult> {
        let mut attr = self.base_attr(self.transform(key));
        attr.offset = offset;
        attr.num = reserve_total;
        attr.flags |= io_flags::PREPARE;
        self.fan_out_write(Command::Write, attr, data.into()).await
    }

    /// Stage another chunk into an open reservation.
    pub async fn write_plain(
        &self,
        key: impl AsRef<[u8]>,
        data: impl Into<Bytes>,
        offset: u64,
    ) -> Result<WriteResult> {
        let mut attr = self.base_attr(self.transform(key));
        attr.offset = offset;
        attr.flags |= io_flags::PLAIN_WRITE;
        self.fan_out_write(Command::Write, attr, data.into()).await
    }

    /// Stage the last chunk and flip the record to committed with total
    /// size `final_total`.
    pub async fn write_commit(
        &self,
        key: impl AsRef<[u8]>,
        data: impl Into<Bytes>,
        offset: u64,
        final_total: u64,
    ) -> Result<WriteResult> {
        let mut attr = self.base_attr(self.transform(key));
        attr.offset = offset;
        attr.num = final_total;
        attr.flags |= io_flags::COMMIT;
        self.fan_out_write(Command::Write, attr, data.into()).await
    }

    pub async fn remove(&self, key: impl AsRef<[u8]>) -> Result<WriteResult> {
        let attr = self.base_attr(self.transform(key));
        self.fan_out_write(Command::Remove, attr, Bytes::new()).await
    }

    async fn fan_out_write(
        &self,
        cmd: Command,
        attr: IoAttr,
        data: Bytes,
    ) -> Result<WriteResult> {
        if self.groups.is_empty() {
            return Err(StoreError::NoRoute);
        }

        let deadline = self.deadline();
        let flags = self.request_flags(frame_flags::NEED_ACK);
        let mut joins = Vec::with_capacity(self.groups.len());
        for &group in &self.groups {
            let node = Arc::clone(&self.node);
            let data = data.clone();
            joins.push((
                group,
                tokio::spawn(async move {
                    write_to_group(node, group, cmd, flags, attr, data, deadline).await
                }),
            ));
        }

        let mut entries = Vec::new();
        for (group, join) in joins {
            match join.await {
                Ok(Ok(group_entries)) => entries.extend(group_entries),
                Ok(Err(error)) => {
                    tracing::debug!("{:?} to group {} failed: {}", cmd, group, error);
                    entries.push(error_entry(group, &error));
                }
                Err(join_error) => {
                    entries.push(error_entry(
                        group,
                        &StoreError::Io(std::io::Error::other(join_error)),
                    ));
                }
            }
        }

        self.finish_write(WriteResult { entries })
    }

    fn finish_write(&self, result: WriteResult) -> Result<WriteResult> {
        match (self.policy, result.error()) {
            (ErrorPolicy::Strict, Some(error)) => Err(error),
            _ => Ok(result),
        }
    }

    // ── reads, lookups, recovery ────────────────────────────────────────

    /// Read from the session's groups in order, returning the first
    /// replica that answers; remaining groups are left untouched.
    pub async fn read_data(
        &self,
        key: impl AsRef<[u8]>,
        offset: u64,
        size: u64,
    ) -> Result<ReadResult> {
        self.read_data_id(self.transform(key), offset, size).await
    }

    pub async fn read_data_id(&self, id: ObjectId, offset: u64, size: u64) -> Result<ReadResult> {
        self.read_id_from_groups(id, &self.groups, offset, size).await
    }

    /// Read over an explicit group list; recovery reads use this to probe
    /// replicas the session would not normally consult.
    pub async fn read_data_groups(
        &self,
        key: impl AsRef<[u8]>,
        groups: &[GroupId],
        offset: u64,
        size: u64,
    ) -> Result<ReadResult> {
        self.read_id_from_groups(self.transform(key), groups, offset, size)
            .await
    }

    async fn read_id_from_groups(
        &self,
        id: ObjectId,
        groups: &[GroupId],
        offset: u64,
        size: u64,
    ) -> Result<ReadResult> {
        let deadline = self.deadline();
        let mut errors = Vec::new();

        for &group in groups {
            match self.read_from_group(group, id, offset, size, deadline).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    tracing::debug!("read {} from group {} failed: {}", id, group, error);
                    errors.push(error);
                }
            }
        }
        Err(representative_error(errors))
    }

    async fn read_from_group(
        &self,
        group: GroupId,
        id: ObjectId,
        offset: u64,
        size: u64,
        deadline: Instant,
    ) -> Result<ReadResult> {
        let mut attr = self.base_attr(id);
        attr.offset = offset;
        attr.size = size;

        let frames = self
            .invoke(
                group,
                &id,
                Command::Read,
                self.request_flags(0),
                encode_io_attr(&attr),
                deadline,
            )
            .await?;
        let frame = final_frame(frames)?;
        let (io_attr, data) = split_io_payload(frame.payload)?;
        Ok(ReadResult { group, io_attr, data })
    }

    /// Record summary without the bytes.
    pub async fn lookup(&self, key: impl AsRef<[u8]>) -> Result<LookupResult> {
        let id = self.transform(key);
        let deadline = self.deadline();
        let mut errors = Vec::new();

        for &group in &self.groups {
            let attr = self.base_attr(id);
            let result = self
                .invoke(
                    group,
                    &id,
                    Command::Lookup,
                    self.request_flags(0),
                    encode_io_attr(&attr),
                    deadline,
                )
                .await
                .and_then(final_frame);
            match result {
                Ok(frame) => {
                    let (io_attr, _) = split_io_payload(frame.payload)?;
                    return Ok(LookupResult { group, io_attr });
                }
                Err(error) => errors.push(error),
            }
        }
        Err(representative_error(errors))
    }

    // ── bulk transfer ───────────────────────────────────────────────────

    /// Write a batch to every session group; items are partitioned by
    /// their primary replica inside each group. With N items and M groups
    /// all accepting, the number of successful final responses is N·M.
    pub async fn bulk_write(
        &self,
        ios: Vec<IoAttr>,
        blobs: Vec<Bytes>,
    ) -> Result<WriteResult> {
        if ios.len() != blobs.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} io attrs for {} blobs",
                ios.len(),
                blobs.len()
            )));
        }
        if self.groups.is_empty() {
            return Err(StoreError::NoRoute);
        }

        let items: Vec<(IoAttr, Bytes)> = ios
            .into_iter()
            .zip(blobs)
            .map(|(mut attr, blob)| {
                attr.flags |= self.ioflags;
                attr.size = blob.len() as u64;
                (attr, blob)
            })
            .collect();

        let deadline = self.deadline();
        let flags = self.request_flags(frame_flags::NEED_ACK);
        let mut joins = Vec::new();

        for &group in &self.groups {
            let mut per_addr: HashMap<NodeAddr, Vec<&(IoAttr, Bytes)>> = HashMap::new();
            for item in &items {
                let addr = match self.node.routes().primary_for(group, &item.0.id) {
                    Ok(addr) => addr,
                    Err(error) => {
                        joins.push((group, spawn_failed(error)));
                        continue;
                    }
                };
                per_addr.entry(addr).or_default().push(item);
            }

            for (addr, batch) in per_addr {
                let mut payload = bytes::BytesMut::new();
                for (attr, blob) in &batch {
                    attr.encode(&mut payload);
                    payload.extend_from_slice(blob);
                }
                let anchor = batch[0].0.id;
                let node = Arc::clone(&self.node);
                let payload = payload.freeze();
                joins.push((
                    group,
                    tokio::spawn(async move {
                        invoke_addr(
                            node,
                            addr,
                            anchor,
                            Command::BulkWrite,
                            flags,
                            payload,
                            deadline,
                        )
                        .await
                        .map(|frames| frames_to_entries(group, frames))
                    }),
                ));
            }
        }

        let mut entries = Vec::new();
        for (group, join) in joins {
            match join.await {
                Ok(Ok(batch_entries)) => entries.extend(batch_entries),
                Ok(Err(error)) => entries.push(error_entry(group, &error)),
                Err(join_error) => entries.push(error_entry(
                    group,
                    &StoreError::Io(std::io::Error::other(join_error)),
                )),
            }
        }

        self.finish_write(WriteResult { entries })
    }

    /// Fetch a batch of keys; the result is unordered and callers match
    /// entries back through the ID.
    pub async fn bulk_read(
        &self,
        keys: &[impl AsRef<[u8]>],
    ) -> Result<Vec<BulkReadEntry>> {
        let deadline = self.deadline();
        let mut remaining: Vec<ObjectId> = keys.iter().map(|key| self.transform(key)).collect();
        let mut found = Vec::new();

        for &group in &self.groups {
            if remaining.is_empty() {
                break;
            }

            let mut per_addr: HashMap<NodeAddr, Vec<ObjectId>> = HashMap::new();
            for id in &remaining {
                let Ok(addr) = self.node.routes().primary_for(group, id) else {
                    continue;
                };
                per_addr.entry(addr).or_default().push(*id);
            }

            for (addr, ids) in per_addr {
                let mut payload = bytes::BytesMut::with_capacity(ids.len() * 64);
                for id in &ids {
                    payload.extend_from_slice(id.as_bytes());
                }

                let frames = match invoke_addr(
                    Arc::clone(&self.node),
                    addr,
                    ids[0],
                    Command::BulkRead,
                    self.request_flags(0),
                    payload.freeze(),
                    deadline,
                )
                .await
                {
                    Ok(frames) => frames,
                    Err(error) => {
                        tracing::debug!("bulk read on group {} failed: {}", group, error);
                        continue;
                    }
                };

                for frame in frames {
                    if frame.header.is_ack() || frame.payload.len() < IO_ATTR_WIRE_LEN {
                        continue;
                    }
                    let (io_attr, data) = split_io_payload(frame.payload)?;
                    remaining.retain(|id| *id != io_attr.id);
                    found.push(BulkReadEntry { group, io_attr, data });
                }
            }
        }

        if found.is_empty() && !keys.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(found)
    }

    // ── ranged iteration ────────────────────────────────────────────────

    /// Ordered scan of `[attr.id, attr.parent)` on one group, skipping
    /// `attr.start` records and returning at most `attr.num`.
    pub async fn read_data_range(&self, attr: IoAttr, group: GroupId) -> Result<RangeResult> {
        let mut attr = attr;
        attr.flags |= self.ioflags;
        self.range_request(attr, group).await
    }

    /// Delete the range; each response carries the number of records it
    /// removed in `io_attr.num`.
    pub async fn remove_data_range(&self, attr: IoAttr, group: GroupId) -> Result<RangeResult> {
        let mut attr = attr;
        attr.flags |= self.ioflags | io_flags::REMOVE;
        self.range_request(attr, group).await
    }

    async fn range_request(&self, attr: IoAttr, group: GroupId) -> Result<RangeResult> {
        let frames = self
            .invoke(
                group,
                &attr.id,
                Command::Range,
                self.request_flags(0),
                encode_io_attr(&attr),
                self.deadline(),
            )
            .await?;

        let mut entries = Vec::new();
        for frame in frames {
            if frame.header.status < 0 {
                return Err(StoreError::from_wire_code(frame.header.status));
            }
            if frame.payload.len() < IO_ATTR_WIRE_LEN {
                continue;
            }
            let (io_attr, data) = split_io_payload(frame.payload)?;
            entries.push(RangeEntry { io_attr, data });
        }
        Ok(RangeResult { entries })
    }

    // ── tag indexes ─────────────────────────────────────────────────────

    /// Replace the key's tag set; empty `tags` clears every index entry
    /// the key had.
    pub async fn set_indexes(
        &self,
        key: impl AsRef<[u8]>,
        tags: &[String],
        payloads: Vec<Vec<u8>>,
    ) -> Result<()> {
        if !payloads.is_empty() && payloads.len() != tags.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} payloads for {} tags",
                payloads.len(),
                tags.len()
            )));
        }

        let mut payloads = payloads;
        payloads.resize(tags.len(), Vec::new());
        let request = IndexSetRequest {
            key: self.transform(key),
            entries: tags
                .iter()
                .zip(payloads)
                .map(|(tag, payload)| TagPayload { tag: tag.clone(), payload })
                .collect(),
        };
        let payload = Bytes::from(serde_json::to_vec(&request)?);

        let deadline = self.deadline();
        let anchor = index_anchor();
        let mut errors = Vec::new();
        let mut succeeded = false;
        for &group in &self.groups {
            let result = self
                .invoke(
                    group,
                    &anchor,
                    Command::IndexSet,
                    self.request_flags(0),
                    payload.clone(),
                    deadline,
                )
                .await
                .and_then(final_frame);
            match result {
                Ok(_) => succeeded = true,
                Err(error) => {
                    tracing::debug!("index set on group {} failed: {}", group, error);
                    errors.push(error);
                }
            }
        }

        if succeeded {
            Ok(())
        } else {
            Err(representative_error(errors))
        }
    }

    /// Keys present in every one of `tags`.
    pub async fn find_all_indexes(&self, tags: &[String]) -> Result<Vec<FindIndexResult>> {
        self.find_indexes(FindMode::All, tags).await
    }

    /// Keys present in at least one of `tags`.
    pub async fn find_any_indexes(&self, tags: &[String]) -> Result<Vec<FindIndexResult>> {
        self.find_indexes(FindMode::Any, tags).await
    }

    async fn find_indexes(
        &self,
        mode: FindMode,
        tags: &[String],
    ) -> Result<Vec<FindIndexResult>> {
        let request = IndexFindRequest { mode, tags: tags.to_vec() };
        let payload = Bytes::from(serde_json::to_vec(&request)?);

        let deadline = self.deadline();
        let anchor = index_anchor();
        let mut errors = Vec::new();
        for &group in &self.groups {
            let result = self
                .invoke(
                    group,
                    &anchor,
                    Command::IndexFind,
                    self.request_flags(0),
                    payload.clone(),
                    deadline,
                )
                .await
                .and_then(final_frame);
            match result {
                Ok(frame) => return Ok(serde_json::from_slice(&frame.payload)?),
                Err(error) => errors.push(error),
            }
        }
        Err(representative_error(errors))
    }

    // ── notifications ───────────────────────────────────────────────────

    /// Subscribe to writes on `key` at the session's first group. The
    /// returned stream yields one event per observed write until
    /// [`Session::drop_notification`] tears the subscription down.
    pub async fn request_notification(&self, key: impl AsRef<[u8]>) -> Result<NotifyStream> {
        let id = self.transform(key);
        let &group = self.groups.first().ok_or(StoreError::NoRoute)?;
        let addr = self.node.routes().primary_for(group, &id)?;

        let mut handle = self.node.transactions().begin();
        let frame = Frame::request(
            id,
            Command::Notify,
            self.request_flags(frame_flags::NEED_ACK),
            handle.trans(),
            Bytes::copy_from_slice(&0u32.to_le_bytes()),
        );
        self.node
            .transport()
            .send(self.node.addr(), &addr, frame)
            .await?;

        // Registration is confirmed by the first (ack) frame.
        let ack = handle.recv(self.deadline()).await?;
        if ack.header.status < 0 {
            return Err(StoreError::from_wire_code(ack.header.status));
        }
        Ok(NotifyStream { handle })
    }

    pub async fn drop_notification(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let id = self.transform(key);
        let &group = self.groups.first().ok_or(StoreError::NoRoute)?;

        let frames = self
            .invoke(
                group,
                &id,
                Command::Notify,
                self.request_flags(0),
                Bytes::copy_from_slice(&NOTIFY_DROP.to_le_bytes()),
                self.deadline(),
            )
            .await?;
        final_frame(frames).map(|_| ())
    }

    // ── plumbing ────────────────────────────────────────────────────────

    async fn invoke(
        &self,
        group: GroupId,
        route_id: &ObjectId,
        cmd: Command,
        flags: u32,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Vec<Frame>> {
        let addr = self.node.routes().primary_for(group, route_id)?;
        invoke_addr(
            Arc::clone(&self.node),
            addr,
            *route_id,
            cmd,
            flags,
            payload,
            deadline,
        )
        .await
    }
}

/// Index objects of a group all live with one anchor replica, so set and
/// find consistently land on the same node.
fn index_anchor() -> ObjectId {
    ObjectId::transform(b"index-root")
}

async fn invoke_addr(
    node: Arc<Node>,
    addr: NodeAddr,
    id: ObjectId,
    cmd: Command,
    flags: u32,
    payload: Bytes,
    deadline: Instant,
) -> Result<Vec<Frame>> {
    let mut handle = node.transactions().begin();
    let frame = Frame::request(id, cmd, flags, handle.trans(), payload);
    node.transport().send(node.addr(), &addr, frame).await?;
    handle.collect(deadline).await
}

async fn write_to_group(
    node: Arc<Node>,
    group: GroupId,
    cmd: Command,
    flags: u32,
    attr: IoAttr,
    data: Bytes,
    deadline: Instant,
) -> Result<Vec<WriteEntry>> {
    let addr = node.routes().primary_for(group, &attr.id)?;
    let payload = if data.is_empty() {
        encode_io_attr(&attr)
    } else {
        encode_record_payload(&attr, &data)
    };
    let frames = invoke_addr(node, addr, attr.id, cmd, flags, payload, deadline).await?;
    Ok(frames_to_entries(group, frames))
}

fn frames_to_entries(group: GroupId, frames: Vec<Frame>) -> Vec<WriteEntry> {
    frames
        .into_iter()
        .map(|frame| {
            let io_attr = (frame.payload.len() >= IO_ATTR_WIRE_LEN)
                .then(|| split_io_payload(frame.payload.clone()).ok())
                .flatten()
                .map(|(attr, _)| attr);
            WriteEntry {
                group,
                status: frame.header.status,
                is_ack: frame.header.is_ack(),
                io_attr,
            }
        })
        .collect()
}

fn error_entry(group: GroupId, error: &StoreError) -> WriteEntry {
    WriteEntry {
        group,
        status: error.wire_code(),
        is_ack: false,
        io_attr: None,
    }
}

fn final_frame(frames: Vec<Frame>) -> Result<Frame> {
    let frame = frames
        .into_iter()
        .next_back()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("empty response stream")))?;
    if frame.header.status < 0 {
        return Err(StoreError::from_wire_code(frame.header.status));
    }
    Ok(frame)
}

fn spawn_failed(error: StoreError) -> tokio::task::JoinHandle<Result<Vec<WriteEntry>>> {
    tokio::spawn(async move { Err(error) })
}

/// Pick the error representing a fully failed multi-group call: the first
/// that is neither no-route nor not-found, else not-found when any group
/// reported it, else no-route.
fn representative_error(errors: Vec<StoreError>) -> StoreError {
    let mut saw_not_found = false;
    let mut first_hard: Option<StoreError> = None;
    for error in errors {
        match error {
            StoreError::NoRoute => {}
            StoreError::NotFound => saw_not_found = true,
            other => {
                if first_hard.is_none() {
                    first_hard = Some(other);
                }
            }
        }
    }
    if let Some(error) = first_hard {
        error
    } else if saw_not_found {
        StoreError::NotFound
    } else {
        StoreError::NoRoute
    }
}
