use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StoreError};
use crate::id::{ObjectId, ID_LEN};

/// Frame flag bits. Stable across peers.
pub mod frame_flags {
    /// Caller expects a progress ack before the final response.
    pub const NEED_ACK: u32 = 1 << 0;
    /// This frame is a response.
    pub const REPLY: u32 = 1 << 1;
    /// More response frames follow for the same transaction.
    pub const MORE: u32 = 1 << 2;
    /// Do not forward to another node.
    pub const DIRECT: u32 = 1 << 3;
}

/// Commands understood by every node. Numbers are stable across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Write = 1,
    Read = 2,
    Lookup = 3,
    Remove = 4,
    Notify = 5,
    Range = 6,
    BulkRead = 7,
    BulkWrite = 8,
    IndexSet = 9,
    IndexFind = 10,
}

impl Command {
    pub fn from_wire(raw: u32) -> Result<Command> {
        Ok(match raw {
            1 => Command::Write,
            2 => Command::Read,
            3 => Command::Lookup,
            4 => Command::Remove,
            5 => Command::Notify,
            6 => Command::Range,
            7 => Command::BulkRead,
            8 => Command::BulkWrite,
            9 => Command::IndexSet,
            10 => Command::IndexFind,
            other => {
                return Err(StoreError::Unsupported(format!("unknown command {}", other)))
            }
        })
    }
}

/// Fixed-size header at the front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: ObjectId,
    pub status: i32,
    pub cmd: u32,
    pub flags: u32,
    pub size: u64,
    pub trans: u64,
}

/// Encoded width of [`FrameHeader`] on the wire.
pub const FRAME_HEADER_LEN: usize = ID_LEN + 4 + 4 + 4 + 8 + 8;

impl FrameHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.id.as_bytes());
        buf.put_i32_le(self.status);
        buf.put_u32_le(self.cmd);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.trans);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<FrameHeader> {
        if buf.remaining() < FRAME_HEADER_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "frame header truncated: {} of {} bytes",
                buf.remaining(),
                FRAME_HEADER_LEN
            )));
        }

        let mut id = [0u8; ID_LEN];
        buf.copy_to_slice(&mut id);

        Ok(FrameHeader {
            id: ObjectId(id),
            status: buf.get_i32_le(),
            cmd: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            size: buf.get_u64_le(),
            trans: buf.get_u64_le(),
        })
    }

    pub fn has_flag(&self, bit: u32) -> bool {
        self.flags & bit != 0
    }

    pub fn is_reply(&self) -> bool {
        self.has_flag(frame_flags::REPLY)
    }

    /// Replies keep arriving for this transaction after the current frame.
    pub fn has_more(&self) -> bool {
        self.has_flag(frame_flags::MORE)
    }

    /// A progress ack rather than a result.
    pub fn is_ack(&self) -> bool {
        self.is_reply() && self.has_flag(frame_flags::NEED_ACK)
    }
}

/// One message on the transport: header plus `header.size` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(id: ObjectId, cmd: Command, flags: u32, trans: u64, payload: Bytes) -> Frame {
        Frame {
            header: FrameHeader {
                id,
                status: 0,
                cmd: cmd as u32,
                flags,
                size: payload.len() as u64,
                trans,
            },
            payload,
        }
    }

    /// Build a response to `req`, keeping its id, command and transaction.
    pub fn reply(req: &FrameHeader, status: i32, extra_flags: u32, payload: Bytes) -> Frame {
        Frame {
            header: FrameHeader {
                id: req.id,
                status,
                cmd: req.cmd,
                flags: frame_flags::REPLY | extra_flags,
                size: payload.len() as u64,
                trans: req.trans,
            },
            payload,
        }
    }

    /// Intermediate progress ack: empty payload, NEED_ACK echoed back.
    pub fn ack(req: &FrameHeader, status: i32) -> Frame {
        Frame::reply(
            req,
            status,
            frame_flags::MORE | frame_flags::NEED_ACK,
            Bytes::new(),
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Frame> {
        let header = FrameHeader::decode(&mut raw)?;
        if (raw.remaining() as u64) < header.size {
            return Err(StoreError::InvalidArgument(format!(
                "frame payload truncated: {} of {} bytes",
                raw.remaining(),
                header.size
            )));
        }
        let payload = raw.split_to(header.size as usize);
        Ok(Frame { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = FrameHeader {
            id: ObjectId::MIN,
            status: -2,
            cmd: Command::Write as u32,
            flags: frame_flags::NEED_ACK,
            size: 10,
            trans: 0x0102_0304_0506_0708,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
        assert_eq!(&buf[ID_LEN..ID_LEN + 4], &(-2i32).to_le_bytes());
        assert_eq!(&buf[FRAME_HEADER_LEN - 8..], &header.trans.to_le_bytes());

        let decoded = FrameHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame::request(
            ObjectId::transform(b"frame"),
            Command::Read,
            frame_flags::NEED_ACK,
            99,
            Bytes::from_static(b"payload"),
        );

        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.header.size, 7);
    }

    #[test]
    fn reply_keeps_transaction_and_marks_ack() {
        let req = Frame::request(
            ObjectId::transform(b"req"),
            Command::Write,
            frame_flags::NEED_ACK,
            7,
            Bytes::new(),
        );

        let ack = Frame::ack(&req.header, 0);
        assert!(ack.header.is_reply());
        assert!(ack.header.is_ack());
        assert!(ack.header.has_more());
        assert_eq!(ack.header.trans, 7);

        let fin = Frame::reply(&req.header, 0, 0, Bytes::from_static(b"x"));
        assert!(fin.header.is_reply());
        assert!(!fin.header.is_ack());
        assert!(!fin.header.has_more());
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Command::from_wire(42).is_err());
        assert_eq!(Command::from_wire(6).unwrap(), Command::Range);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let frame = Frame::request(
            ObjectId::MIN,
            Command::Read,
            0,
            1,
            Bytes::from_static(b"abcdef"),
        );
        let encoded = frame.encode();
        let cut = encoded.slice(..encoded.len() - 2);
        assert!(Frame::decode(cut).is_err());
    }
}
