//! Inbound command dispatch for one node.
//!
//! Every non-reply frame lands here. Handlers run against the backend,
//! the cache tier and the notify registry, and produce the ordered list
//! of response frames to send back: optional progress acks first, data
//! frames flagged MORE, and exactly one final frame without MORE.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::time::Duration;

use crate::backend::{Backend, IdRange, Record};
use crate::cache::CacheTier;
use crate::error::{Result, StoreError};
use crate::id::ObjectId;
use crate::index::{self, IndexFindRequest, IndexSetRequest};
use crate::io_attr::{io_flags, IoAttr, Timestamp};
use crate::notify::{notify_payload, NotifyObserver, NotifyRegistry};
use crate::routing::NodeAddr;
use crate::transport::FrameTransport;
use crate::wire::{frame_flags, Command, Frame, FrameHeader};

/// Notification request payload: a single little-endian word, non-zero to
/// drop the subscription instead of creating one.
pub const NOTIFY_DROP: u32 = 1;

pub struct CommandRouter {
    local_addr: NodeAddr,
    backend: Arc<dyn Backend>,
    cache: Option<Arc<CacheTier>>,
    notify: Arc<NotifyRegistry>,
    transport: Arc<dyn FrameTransport>,
}

impl CommandRouter {
    pub fn new(
        local_addr: NodeAddr,
        backend: Arc<dyn Backend>,
        cache: Option<Arc<CacheTier>>,
        notify: Arc<NotifyRegistry>,
        transport: Arc<dyn FrameTransport>,
    ) -> CommandRouter {
        CommandRouter { local_addr, backend, cache, notify, transport }
    }

    /// Process one inbound request frame into its response frames.
    pub async fn handle(&self, from: &NodeAddr, frame: Frame) -> Vec<Frame> {
        let header = frame.header;
        let result = match Command::from_wire(header.cmd) {
            Ok(Command::Write) => self.handle_write(from, &frame).await,
            Ok(Command::Read) => self.handle_read(&frame).await,
            Ok(Command::Lookup) => self.handle_lookup(&frame).await,
            Ok(Command::Remove) => self.handle_remove(from, &frame).await,
            Ok(Command::Notify) => self.handle_notify(from, &frame).await,
            Ok(Command::Range) => self.handle_range(from, &frame).await,
            Ok(Command::BulkRead) => self.handle_bulk_read(&frame).await,
            Ok(Command::BulkWrite) => self.handle_bulk_write(from, &frame).await,
            Ok(Command::IndexSet) => self.handle_index_set(&frame).await,
            Ok(Command::IndexFind) => self.handle_index_find(&frame).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(responses) => responses,
            Err(error) => {
                tracing::debug!(
                    "command {} on {} failed: {} (status {})",
                    header.cmd,
                    header.id,
                    error,
                    error.wire_code()
                );
                vec![Frame::reply(&header, error.wire_code(), 0, Bytes::new())]
            }
        }
    }

    async fn handle_write(&self, from: &NodeAddr, frame: &Frame) -> Result<Vec<Frame>> {
        let (attr, data) = split_io_payload(frame.payload.clone())?;
        let response_attr = self.apply_write(&attr, data).await?;
        self.notify.publish(&attr.id, attr, from.clone());

        let mut responses = Vec::with_capacity(2);
        if frame.header.has_flag(frame_flags::NEED_ACK) {
            responses.push(Frame::ack(&frame.header, 0));
        }
        responses.push(Frame::reply(
            &frame.header,
            0,
            0,
            encode_io_attr(&response_attr),
        ));
        Ok(responses)
    }

    /// Route one write by its IO flags; returns the response attributes.
    async fn apply_write(&self, attr: &IoAttr, data: Bytes) -> Result<IoAttr> {
        if attr.has_flag(io_flags::CACHE_ONLY) {
            let cache = self.cache.as_ref().ok_or_else(|| {
                StoreError::Unsupported("node has no cache tier".to_string())
            })?;
            cache.insert(attr.id, data.clone(), cache_ttl(attr), true);
            let mut echo = *attr;
            echo.timestamp = attr.timestamp.resolve();
            echo.size = data.len() as u64;
            echo.parent = ObjectId::transform(&data);
            return Ok(echo);
        }

        let plain_overwrite = attr.flags
            & (io_flags::APPEND | io_flags::PREPARE | io_flags::PLAIN_WRITE | io_flags::COMMIT)
            == 0
            && attr.offset == 0;

        let response = if attr.has_flag(io_flags::APPEND) {
            // Append wins over a combined reservation: the result must be
            // readable right away.
            self.backend.append(attr, data.clone()).await?.to_io_attr()
        } else if attr.has_flag(io_flags::PREPARE) {
            self.backend.prepare(&attr.id, attr.num).await?;
            if !data.is_empty() {
                self.backend
                    .plain_write(&attr.id, attr.offset, data.clone())
                    .await?;
            }
            staged_echo(attr, data.len())
        } else if attr.has_flag(io_flags::COMMIT) {
            if !data.is_empty() {
                self.backend
                    .plain_write(&attr.id, attr.offset, data.clone())
                    .await?;
            }
            self.backend.commit(attr, attr.num).await?.to_io_attr()
        } else if attr.has_flag(io_flags::PLAIN_WRITE) {
            self.backend
                .plain_write(&attr.id, attr.offset, data.clone())
                .await?;
            staged_echo(attr, data.len())
        } else {
            self.backend.write(attr, data.clone()).await?.to_io_attr()
        };

        if attr.has_flag(io_flags::CACHE) {
            if let Some(cache) = &self.cache {
                if plain_overwrite {
                    cache.insert(attr.id, data, cache_ttl(attr), false);
                } else {
                    cache.remove(&attr.id);
                }
            }
        }

        Ok(response)
    }

    async fn handle_read(&self, frame: &Frame) -> Result<Vec<Frame>> {
        let (attr, _) = split_io_payload(frame.payload.clone())?;
        let record = self.read_record(&attr).await?;

        let mut response_attr = record.summary.to_io_attr();
        response_attr.offset = attr.offset;
        response_attr.size = record.data.len() as u64;

        Ok(vec![Frame::reply(
            &frame.header,
            0,
            0,
            encode_record_payload(&response_attr, &record.data),
        )])
    }

    async fn read_record(&self, attr: &IoAttr) -> Result<Record> {
        if attr.has_flag(io_flags::CACHE) {
            if let Some(cache) = &self.cache {
                if let Some(blob) = cache.get(&attr.id) {
                    return cached_record(attr, blob);
                }
            }
            if attr.has_flag(io_flags::CACHE_ONLY) {
                return Err(StoreError::NotFound);
            }

            let record = self.backend.read(&attr.id, attr.offset, attr.size).await?;
            if let Some(cache) = &self.cache {
                if attr.offset == 0 && attr.size == 0 {
                    let verified = attr.has_flag(io_flags::NOCSUM)
                        || record.summary.parent_checksum == ObjectId::transform(&record.data);
                    if verified {
                        cache.insert(attr.id, record.data.clone(), None, false);
                    } else {
                        tracing::warn!(
                            "not caching {}: checksum does not cover current bytes",
                            attr.id
                        );
                    }
                }
            }
            return Ok(record);
        }

        self.backend.read(&attr.id, attr.offset, attr.size).await
    }

    async fn handle_lookup(&self, frame: &Frame) -> Result<Vec<Frame>> {
        let (attr, _) = split_io_payload(frame.payload.clone())?;
        let summary = self.backend.lookup(&attr.id).await?;
        Ok(vec![Frame::reply(
            &frame.header,
            0,
            0,
            encode_io_attr(&summary.to_io_attr()),
        )])
    }

    async fn handle_remove(&self, from: &NodeAddr, frame: &Frame) -> Result<Vec<Frame>> {
        let (attr, _) = split_io_payload(frame.payload.clone())?;

        let removed_from_cache = match &self.cache {
            Some(cache) if attr.has_flag(io_flags::CACHE) => cache.remove(&attr.id),
            _ => false,
        };

        if attr.has_flag(io_flags::CACHE_ONLY) {
            if !removed_from_cache {
                return Err(StoreError::NotFound);
            }
        } else {
            match self.backend.remove(&attr.id).await {
                Ok(()) => {}
                // A cache hit still counts as a successful removal.
                Err(StoreError::NotFound) if removed_from_cache => {}
                Err(error) => return Err(error),
            }
        }

        self.notify.publish(&attr.id, attr, from.clone());

        let mut responses = Vec::with_capacity(2);
        if frame.header.has_flag(frame_flags::NEED_ACK) {
            responses.push(Frame::ack(&frame.header, 0));
        }
        responses.push(Frame::reply(&frame.header, 0, 0, Bytes::new()));
        Ok(responses)
    }

    async fn handle_notify(&self, from: &NodeAddr, frame: &Frame) -> Result<Vec<Frame>> {
        let mut payload = frame.payload.clone();
        if payload.remaining() < 4 {
            return Err(StoreError::InvalidArgument(
                "notify payload must carry the drop word".to_string(),
            ));
        }
        let drop_requested = payload.get_u32_le() == NOTIFY_DROP;

        if drop_requested {
            self.notify.remove(&frame.header.id)?;
            return Ok(vec![Frame::reply(&frame.header, 0, 0, Bytes::new())]);
        }

        let sink = ReplySink::spawn(
            Arc::clone(&self.transport),
            self.local_addr.clone(),
            from.clone(),
            frame.header,
        );
        self.notify.add(frame.header.id, sink);

        // Registration confirmed; the transaction stays open for events.
        Ok(vec![Frame::ack(&frame.header, 0)])
    }

    async fn handle_range(&self, from: &NodeAddr, frame: &Frame) -> Result<Vec<Frame>> {
        let (attr, _) = split_io_payload(frame.payload.clone())?;
        if attr.parent < attr.id {
            return Err(StoreError::InvalidArgument(format!(
                "range end {} precedes begin {}",
                attr.parent, attr.id
            )));
        }
        let range = IdRange { begin: attr.id, end: attr.parent };

        if attr.has_flag(io_flags::REMOVE) {
            return self.remove_range(from, frame, &attr, range).await;
        }

        let mut iter = self.backend.iterate(range).await?;
        let mut responses = Vec::new();
        let mut skipped = 0u64;
        let mut returned = 0u64;

        while let Some(record) = iter.next().await {
            if skipped < attr.start {
                skipped += 1;
                continue;
            }
            if attr.num != 0 && returned >= attr.num {
                break;
            }

            let mut record_attr = record.summary.to_io_attr();
            record_attr.size = record.data.len() as u64;
            responses.push(Frame::reply(
                &frame.header,
                0,
                frame_flags::MORE,
                encode_record_payload(&record_attr, &record.data),
            ));
            returned += 1;
        }

        responses.push(Frame::reply(&frame.header, 0, 0, Bytes::new()));
        Ok(responses)
    }

    async fn remove_range(
        &self,
        from: &NodeAddr,
        frame: &Frame,
        attr: &IoAttr,
        range: IdRange,
    ) -> Result<Vec<Frame>> {
        let iter = self.backend.iterate(range).await?;
        let records = iter.collect().await;

        let mut removed = 0u64;
        for record in records {
            match self.backend.remove(&record.summary.id).await {
                Ok(()) => {
                    removed += 1;
                    self.notify
                        .publish(&record.summary.id, *attr, from.clone());
                }
                Err(StoreError::NotFound) => {}
                Err(error) => return Err(error),
            }
        }

        let mut response_attr = *attr;
        response_attr.num = removed;
        Ok(vec![Frame::reply(
            &frame.header,
            0,
            0,
            encode_io_attr(&response_attr),
        )])
    }

    async fn handle_bulk_read(&self, frame: &Frame) -> Result<Vec<Frame>> {
        let ids = split_id_list(&frame.payload)?;

        let mut responses = Vec::new();
        for id in &ids {
            match self.backend.read(id, 0, 0).await {
                Ok(record) => {
                    let mut attr = record.summary.to_io_attr();
                    attr.size = record.data.len() as u64;
                    responses.push(Frame::reply(
                        &frame.header,
                        0,
                        frame_flags::MORE,
                        encode_record_payload(&attr, &record.data),
                    ));
                }
                Err(StoreError::NotFound) => {}
                Err(error) => return Err(error),
            }
        }

        let status = if responses.is_empty() && !ids.is_empty() {
            StoreError::NotFound.wire_code()
        } else {
            0
        };
        responses.push(Frame::reply(&frame.header, status, 0, Bytes::new()));
        Ok(responses)
    }

    async fn handle_bulk_write(&self, from: &NodeAddr, frame: &Frame) -> Result<Vec<Frame>> {
        let items = split_bulk_items(frame.payload.clone())?;
        if items.is_empty() {
            return Err(StoreError::InvalidArgument(
                "bulk write carries no items".to_string(),
            ));
        }

        let mut responses = Vec::with_capacity(items.len() * 2);
        let last = items.len() - 1;
        for (index, (attr, data)) in items.into_iter().enumerate() {
            responses.push(Frame::ack(&frame.header, 0));

            let (status, response_attr) = match self.apply_write(&attr, data).await {
                Ok(response_attr) => {
                    self.notify.publish(&attr.id, attr, from.clone());
                    (0, response_attr)
                }
                Err(error) => {
                    tracing::debug!("bulk item {} failed: {}", attr.id, error);
                    (error.wire_code(), attr)
                }
            };

            let more = if index == last { 0 } else { frame_flags::MORE };
            responses.push(Frame::reply(
                &frame.header,
                status,
                more,
                encode_io_attr(&response_attr),
            ));
        }
        Ok(responses)
    }

    async fn handle_index_set(&self, frame: &Frame) -> Result<Vec<Frame>> {
        let request: IndexSetRequest = serde_json::from_slice(&frame.payload)?;
        index::set_indexes(self.backend.as_ref(), &request).await?;
        Ok(vec![Frame::reply(&frame.header, 0, 0, Bytes::new())])
    }

    async fn handle_index_find(&self, frame: &Frame) -> Result<Vec<Frame>> {
        let request: IndexFindRequest = serde_json::from_slice(&frame.payload)?;
        let results = index::find_indexes(self.backend.as_ref(), &request).await?;
        let payload = Bytes::from(serde_json::to_vec(&results)?);
        Ok(vec![Frame::reply(&frame.header, 0, 0, payload)])
    }
}

enum SinkMessage {
    Event(crate::notify::NotifyEvent),
    Close,
}

/// Forwards notification events to a subscribed peer.
///
/// A single forwarder task drains the queue, so a subscriber sees events
/// in publication order and the terminating reply only after them.
struct ReplySink {
    queue: tokio::sync::mpsc::UnboundedSender<SinkMessage>,
}

impl ReplySink {
    fn spawn(
        transport: Arc<dyn FrameTransport>,
        local_addr: NodeAddr,
        peer: NodeAddr,
        request: FrameHeader,
    ) -> Arc<ReplySink> {
        let (queue, mut rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    SinkMessage::Event(event) => {
                        let frame = Frame::reply(
                            &request,
                            0,
                            frame_flags::MORE,
                            notify_payload::encode(&event),
                        );
                        if let Err(error) = transport.send(&local_addr, &peer, frame).await {
                            tracing::debug!("dropping notification for {}: {}", peer, error);
                        }
                    }
                    SinkMessage::Close => {
                        let frame = Frame::reply(&request, 0, 0, Bytes::new());
                        let _ = transport.send(&local_addr, &peer, frame).await;
                        break;
                    }
                }
            }
        });

        Arc::new(ReplySink { queue })
    }
}

impl NotifyObserver for ReplySink {
    fn notify(&self, event: crate::notify::NotifyEvent) {
        let _ = self.queue.send(SinkMessage::Event(event));
    }

    fn closed(&self) {
        let _ = self.queue.send(SinkMessage::Close);
    }
}

fn cache_ttl(attr: &IoAttr) -> Option<Duration> {
    (attr.start > 0).then(|| Duration::from_secs(attr.start))
}

fn staged_echo(attr: &IoAttr, written: usize) -> IoAttr {
    let mut echo = *attr;
    echo.size = written as u64;
    echo
}

fn cached_record(attr: &IoAttr, blob: Bytes) -> Result<Record> {
    let len = blob.len() as u64;
    if attr.offset > len {
        return Err(StoreError::InvalidArgument(format!(
            "read offset {} beyond cached size {}",
            attr.offset, len
        )));
    }
    let available = len - attr.offset;
    let n = if attr.size == 0 { available } else { attr.size.min(available) };
    let data = blob.slice(attr.offset as usize..(attr.offset + n) as usize);

    let summary = crate::backend::RecordSummary {
        id: attr.id,
        size: len,
        user_flags: attr.user_flags,
        timestamp: Timestamp::now(),
        parent_checksum: ObjectId::transform(&blob),
    };
    Ok(Record { summary, data })
}

pub fn encode_io_attr(attr: &IoAttr) -> Bytes {
    let mut buf = BytesMut::with_capacity(crate::io_attr::IO_ATTR_WIRE_LEN);
    attr.encode(&mut buf);
    buf.freeze()
}

pub fn encode_record_payload(attr: &IoAttr, data: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(crate::io_attr::IO_ATTR_WIRE_LEN + data.len());
    attr.encode(&mut buf);
    buf.put_slice(data);
    buf.freeze()
}

/// Decode an IO attribute and leave the remaining bytes as the data part.
pub fn split_io_payload(mut payload: Bytes) -> Result<(IoAttr, Bytes)> {
    let attr = IoAttr::decode(&mut payload)?;
    Ok((attr, payload))
}

fn split_id_list(payload: &Bytes) -> Result<Vec<ObjectId>> {
    if payload.len() % crate::id::ID_LEN != 0 {
        return Err(StoreError::InvalidArgument(format!(
            "bulk id list of {} bytes is not a whole number of ids",
            payload.len()
        )));
    }
    payload
        .chunks(crate::id::ID_LEN)
        .map(ObjectId::from_slice)
        .collect()
}

fn split_bulk_items(mut payload: Bytes) -> Result<Vec<(IoAttr, Bytes)>> {
    let mut items = Vec::new();
    while payload.has_remaining() {
        let attr = IoAttr::decode(&mut payload)?;
        if (payload.remaining() as u64) < attr.size {
            return Err(StoreError::InvalidArgument(format!(
                "bulk item for {} truncated: {} of {} bytes",
                attr.id,
                payload.remaining(),
                attr.size
            )));
        }
        let data = payload.split_to(attr.size as usize);
        items.push((attr, data));
    }
    Ok(items)
}
