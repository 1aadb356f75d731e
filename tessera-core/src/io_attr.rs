use bytes::{Buf, BufMut};

use crate::error::{Result, StoreError};
use crate::id::{ObjectId, ID_LEN};

/// IO flag bits carried in [`IoAttr::flags`].
///
/// The numeric values are part of the wire contract and must not change.
pub mod io_flags {
    /// Ignore the caller-supplied offset and write at the record's end.
    pub const APPEND: u32 = 1 << 0;
    /// Reserve space and stage the first chunk; record stays invisible.
    pub const PREPARE: u32 = 1 << 1;
    /// Write the final chunk and make the staged record visible.
    pub const COMMIT: u32 = 1 << 2;
    /// Write into an existing reservation without committing.
    pub const PLAIN_WRITE: u32 = 1 << 3;
    /// Verify `parent` against the stored record checksum before writing.
    pub const COMPARE_AND_SWAP: u32 = 1 << 4;
    /// Request checksum data in read/lookup responses.
    pub const CHECKSUM: u32 = 1 << 5;
    /// Skip checksum verification when filling the cache from the backend.
    pub const NOCSUM: u32 = 1 << 6;
    /// Route the operation through the in-memory cache tier.
    pub const CACHE: u32 = 1 << 7;
    /// Never fall through to the backend; cache miss means not-found.
    pub const CACHE_ONLY: u32 = 1 << 8;
    /// Turns a RANGE request into a range removal.
    pub const REMOVE: u32 = 1 << 9;
}

/// Seconds + nanoseconds wall-clock stamp.
///
/// The `-1/-1` sentinel asks the backend to stamp with its current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: i64,
}

impl Timestamp {
    pub const SENTINEL: Timestamp = Timestamp { sec: -1, nsec: -1 };

    pub fn now() -> Timestamp {
        let now = chrono::Utc::now();
        Timestamp {
            sec: now.timestamp(),
            nsec: i64::from(now.timestamp_subsec_nanos()),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.sec == -1 && self.nsec == -1
    }

    /// Sentinel stamps resolve to the current time, anything else is kept.
    pub fn resolve(self) -> Timestamp {
        if self.is_sentinel() {
            Timestamp::now()
        } else {
            self
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::SENTINEL
    }
}

/// Per-operation IO attributes, attached to every data command.
///
/// `parent` carries the checksum of the bytes that produced the record at
/// its last write; compare-and-swap matches against it. `start`/`num` are
/// the skip/limit pair for range requests, the reservation and final sizes
/// for prepared writes, and the cache TTL (seconds) for cache writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAttr {
    pub parent: ObjectId,
    pub id: ObjectId,
    pub user_flags: u64,
    pub timestamp: Timestamp,
    pub flags: u32,
    pub start: u64,
    pub num: u64,
    pub offset: u64,
    pub size: u64,
}

/// Encoded width of [`IoAttr`] on the wire.
pub const IO_ATTR_WIRE_LEN: usize = ID_LEN * 2 + 8 * 6 + 4;

impl IoAttr {
    pub fn new(id: ObjectId) -> IoAttr {
        IoAttr {
            parent: ObjectId::MIN,
            id,
            user_flags: 0,
            timestamp: Timestamp::SENTINEL,
            flags: 0,
            start: 0,
            num: 0,
            offset: 0,
            size: 0,
        }
    }

    pub fn builder(id: ObjectId) -> IoAttrBuilder {
        IoAttrBuilder { attr: IoAttr::new(id) }
    }

    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    /// Serialize with the exact wire field order; integers little-endian.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.parent.as_bytes());
        buf.put_slice(self.id.as_bytes());
        buf.put_u64_le(self.user_flags);
        buf.put_i64_le(self.timestamp.sec);
        buf.put_i64_le(self.timestamp.nsec);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.start);
        buf.put_u64_le(self.num);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<IoAttr> {
        if buf.remaining() < IO_ATTR_WIRE_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "io attr truncated: {} of {} bytes",
                buf.remaining(),
                IO_ATTR_WIRE_LEN
            )));
        }

        let mut parent = [0u8; ID_LEN];
        buf.copy_to_slice(&mut parent);
        let mut id = [0u8; ID_LEN];
        buf.copy_to_slice(&mut id);

        Ok(IoAttr {
            parent: ObjectId(parent),
            id: ObjectId(id),
            user_flags: buf.get_u64_le(),
            timestamp: Timestamp {
                sec: buf.get_i64_le(),
                nsec: buf.get_i64_le(),
            },
            flags: buf.get_u32_le(),
            start: buf.get_u64_le(),
            num: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            size: buf.get_u64_le(),
        })
    }
}

/// Field-by-field construction for IO attributes.
#[derive(Debug, Clone)]
pub struct IoAttrBuilder {
    attr: IoAttr,
}

impl IoAttrBuilder {
    pub fn parent(mut self, parent: ObjectId) -> Self {
        self.attr.parent = parent;
        self
    }

    pub fn user_flags(mut self, user_flags: u64) -> Self {
        self.attr.user_flags = user_flags;
        self
    }

    pub fn timestamp(mut self, timestamp: Timestamp) -> Self {
        self.attr.timestamp = timestamp;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.attr.flags = flags;
        self
    }

    pub fn add_flags(mut self, bits: u32) -> Self {
        self.attr.flags |= bits;
        self
    }

    pub fn start(mut self, start: u64) -> Self {
        self.attr.start = start;
        self
    }

    pub fn num(mut self, num: u64) -> Self {
        self.attr.num = num;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.attr.offset = offset;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.attr.size = size;
        self
    }

    pub fn build(self) -> IoAttr {
        self.attr
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn wire_round_trip_preserves_every_field() {
        let attr = IoAttr::builder(ObjectId::transform(b"io-attr"))
            .parent(ObjectId::transform(b"parent"))
            .user_flags(0xdead_beef)
            .timestamp(Timestamp { sec: 1_700_000_000, nsec: 42 })
            .flags(io_flags::APPEND | io_flags::CACHE)
            .start(3)
            .num(14)
            .offset(100)
            .size(4096)
            .build();

        let mut buf = BytesMut::new();
        attr.encode(&mut buf);
        assert_eq!(buf.len(), IO_ATTR_WIRE_LEN);

        let decoded = IoAttr::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn integers_are_little_endian_in_declared_order() {
        let mut attr = IoAttr::new(ObjectId::MIN);
        attr.user_flags = 1;
        attr.size = 2;

        let mut buf = BytesMut::new();
        attr.encode(&mut buf);

        // user_flags sits right after the two 64-byte ids.
        assert_eq!(&buf[ID_LEN * 2..ID_LEN * 2 + 8], &1u64.to_le_bytes());
        // size is the last field.
        assert_eq!(&buf[IO_ATTR_WIRE_LEN - 8..], &2u64.to_le_bytes());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let attr = IoAttr::new(ObjectId::MIN);
        let mut buf = BytesMut::new();
        attr.encode(&mut buf);
        let mut short = buf.freeze().slice(..IO_ATTR_WIRE_LEN - 1);
        assert!(IoAttr::decode(&mut short).is_err());
    }

    #[test]
    fn sentinel_timestamp_resolves_to_now() {
        assert!(Timestamp::SENTINEL.is_sentinel());
        let resolved = Timestamp::SENTINEL.resolve();
        assert!(resolved.sec > 0);

        let fixed = Timestamp { sec: 7, nsec: 8 };
        assert_eq!(fixed.resolve(), fixed);
    }
}
