//! Operation frame for the memcached binary protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CouchbaseError, Result};

use super::constants::*;
use super::opcode::Opcode;
use super::status::ResponseStatus;

/// The direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// A client request (`0x80`).
    Request,
    /// A server response (`0x81`).
    Response,
}

impl Magic {
    /// Creates a `Magic` from the wire byte.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            MAGIC_REQUEST => Some(Self::Request),
            MAGIC_RESPONSE => Some(Self::Response),
            _ => None,
        }
    }

    /// Returns the wire byte.
    pub fn value(self) -> u8 {
        match self {
            Self::Request => MAGIC_REQUEST,
            Self::Response => MAGIC_RESPONSE,
        }
    }
}

/// A single request or response on the data channel.
///
/// Every frame carries a 24-byte header followed by `extras | key | value`.
/// All integer header fields are big-endian. The `vbucket_or_status` field
/// holds the partition id on requests and the status word on responses; the
/// `opaque` is echoed verbatim by the server and correlates responses on a
/// shared connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFrame {
    /// Request or response.
    pub magic: Magic,
    /// The command byte.
    pub opcode: Opcode,
    /// Datatype bits (raw/JSON/snappy).
    pub data_type: u8,
    /// Partition id (requests) or status word (responses).
    pub vbucket_or_status: u16,
    /// Correlator echoed by the server.
    pub opaque: u32,
    /// Check-and-set token.
    pub cas: u64,
    /// Command-specific extras.
    pub extras: Bytes,
    /// The document key.
    pub key: Bytes,
    /// The payload.
    pub value: Bytes,
}

impl OperationFrame {
    /// Creates an empty request frame for the given opcode and partition.
    pub fn request(opcode: Opcode, partition: u16) -> Self {
        Self {
            magic: Magic::Request,
            opcode,
            data_type: DATA_TYPE_RAW,
            vbucket_or_status: partition,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Creates an empty response frame for the given opcode and status.
    pub fn response(opcode: Opcode, status: ResponseStatus) -> Self {
        Self {
            magic: Magic::Response,
            opcode,
            data_type: DATA_TYPE_RAW,
            vbucket_or_status: status.value(),
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Sets the key.
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the value.
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    /// Sets the extras.
    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    /// Sets the CAS token.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Sets the datatype bits.
    pub fn with_data_type(mut self, data_type: u8) -> Self {
        self.data_type = data_type;
        self
    }

    /// Returns the status word of a response frame.
    ///
    /// Meaningless for requests, where the same field carries the partition.
    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from_value(self.vbucket_or_status)
    }

    /// Returns the total body length (`extras + key + value`).
    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Returns the size of this frame on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    /// Writes this frame to the given buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        dst.put_u8(self.magic.value());
        dst.put_u8(self.opcode.value());
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(self.data_type);
        dst.put_u16(self.vbucket_or_status);
        dst.put_u32(self.body_len() as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.put_slice(&self.extras);
        dst.put_slice(&self.key);
        dst.put_slice(&self.value);
    }

    /// Reads a frame from the given buffer.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a complete frame;
    /// the buffer is left untouched in that case. A header that cannot
    /// describe a valid frame is a protocol error.
    pub fn read_from(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([
            src[BODY_LENGTH_OFFSET],
            src[BODY_LENGTH_OFFSET + 1],
            src[BODY_LENGTH_OFFSET + 2],
            src[BODY_LENGTH_OFFSET + 3],
        ]) as usize;

        if src.len() < HEADER_SIZE + body_len {
            return Ok(None);
        }

        let magic = Magic::from_value(src[MAGIC_OFFSET]).ok_or_else(|| {
            CouchbaseError::Protocol(format!("unknown magic byte {:#04x}", src[MAGIC_OFFSET]))
        })?;
        let opcode = Opcode::from_value(src[OPCODE_OFFSET]).ok_or_else(|| {
            CouchbaseError::Protocol(format!("unknown opcode {:#04x}", src[OPCODE_OFFSET]))
        })?;

        let key_len =
            u16::from_be_bytes([src[KEY_LENGTH_OFFSET], src[KEY_LENGTH_OFFSET + 1]]) as usize;
        let extras_len = src[EXTRAS_LENGTH_OFFSET] as usize;
        if extras_len + key_len > body_len {
            return Err(CouchbaseError::Protocol(format!(
                "declared extras ({}) and key ({}) exceed body length {}",
                extras_len, key_len, body_len
            )));
        }

        let data_type = src[DATA_TYPE_OFFSET];
        let vbucket_or_status =
            u16::from_be_bytes([src[VBUCKET_OFFSET], src[VBUCKET_OFFSET + 1]]);
        let opaque = u32::from_be_bytes([
            src[OPAQUE_OFFSET],
            src[OPAQUE_OFFSET + 1],
            src[OPAQUE_OFFSET + 2],
            src[OPAQUE_OFFSET + 3],
        ]);
        let cas = u64::from_be_bytes([
            src[CAS_OFFSET],
            src[CAS_OFFSET + 1],
            src[CAS_OFFSET + 2],
            src[CAS_OFFSET + 3],
            src[CAS_OFFSET + 4],
            src[CAS_OFFSET + 5],
            src[CAS_OFFSET + 6],
            src[CAS_OFFSET + 7],
        ]);

        src.advance(HEADER_SIZE);
        let extras = src.split_to(extras_len).freeze();
        let key = src.split_to(key_len).freeze();
        let value = src.split_to(body_len - extras_len - key_len).freeze();

        Ok(Some(Self {
            magic,
            opcode,
            data_type,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_constructor() {
        let frame = OperationFrame::request(Opcode::Get, 42).with_key(&b"user:17"[..]);
        assert_eq!(frame.magic, Magic::Request);
        assert_eq!(frame.opcode, Opcode::Get);
        assert_eq!(frame.vbucket_or_status, 42);
        assert_eq!(frame.key, Bytes::from_static(b"user:17"));
        assert!(frame.extras.is_empty());
    }

    #[test]
    fn test_wire_size() {
        let frame = OperationFrame::request(Opcode::Set, 0)
            .with_extras(vec![0u8; 8])
            .with_key(&b"k"[..])
            .with_value(&b"value"[..]);
        assert_eq!(frame.body_len(), 8 + 1 + 5);
        assert_eq!(frame.wire_size(), HEADER_SIZE + 14);
    }

    #[test]
    fn test_write_and_read_frame() {
        let original = OperationFrame::request(Opcode::Set, 513)
            .with_extras(vec![0u8, 0, 0, 1, 0, 0, 0, 0])
            .with_key(&b"answer"[..])
            .with_value(&b"42"[..])
            .with_cas(0xDEAD_BEEF);
        let mut buf = BytesMut::new();
        original.write_to(&mut buf);

        assert_eq!(buf.len(), original.wire_size());
        assert_eq!(buf[0], MAGIC_REQUEST);

        let decoded = OperationFrame::read_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_field_layout() {
        let mut frame = OperationFrame::request(Opcode::Delete, 0x0102).with_key(&b"k"[..]);
        frame.opaque = 0x0A0B0C0D;
        frame.cas = 0x1112131415161718;
        let mut buf = BytesMut::new();
        frame.write_to(&mut buf);

        assert_eq!(buf[OPCODE_OFFSET], 0x04);
        assert_eq!(&buf[KEY_LENGTH_OFFSET..KEY_LENGTH_OFFSET + 2], &[0x00, 0x01]);
        assert_eq!(&buf[VBUCKET_OFFSET..VBUCKET_OFFSET + 2], &[0x01, 0x02]);
        assert_eq!(
            &buf[OPAQUE_OFFSET..OPAQUE_OFFSET + 4],
            &[0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert_eq!(
            &buf[CAS_OFFSET..CAS_OFFSET + 8],
            &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]
        );
    }

    #[test]
    fn test_response_status_accessor() {
        let frame = OperationFrame::response(Opcode::Get, ResponseStatus::KeyNotFound);
        assert_eq!(frame.status(), ResponseStatus::KeyNotFound);
    }

    #[test]
    fn test_read_incomplete_header() {
        let mut buf = BytesMut::from(&[MAGIC_REQUEST, 0x00, 0x00][..]);
        assert!(OperationFrame::read_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_read_incomplete_body() {
        let frame = OperationFrame::request(Opcode::Set, 0)
            .with_key(&b"key"[..])
            .with_value(&b"value"[..]);
        let mut buf = BytesMut::new();
        frame.write_to(&mut buf);
        buf.truncate(buf.len() - 2);

        assert!(OperationFrame::read_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_read_unknown_magic() {
        let mut buf = BytesMut::from(&[0x55u8; HEADER_SIZE][..]);
        // zero the body length so only the magic is at fault
        buf[BODY_LENGTH_OFFSET..BODY_LENGTH_OFFSET + 4].copy_from_slice(&[0, 0, 0, 0]);
        let err = OperationFrame::read_from(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unknown magic"));
    }

    #[test]
    fn test_read_lengths_exceeding_body() {
        let frame = OperationFrame::request(Opcode::Get, 0).with_key(&b"abc"[..]);
        let mut buf = BytesMut::new();
        frame.write_to(&mut buf);
        // claim a 5-byte key inside a 3-byte body
        buf[KEY_LENGTH_OFFSET..KEY_LENGTH_OFFSET + 2].copy_from_slice(&[0x00, 0x05]);

        let err = OperationFrame::read_from(&mut buf).unwrap_err();
        assert!(err.to_string().contains("exceed body length"));
    }

    #[test]
    fn test_round_trip_every_opcode() {
        for opcode in Opcode::all() {
            let frame = OperationFrame::request(*opcode, 7)
                .with_key(&b"k"[..])
                .with_value(&b"v"[..]);
            let mut buf = BytesMut::new();
            frame.write_to(&mut buf);
            let decoded = OperationFrame::read_from(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame, "opcode {:?}", opcode);
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = OperationFrame::request(Opcode::Get, 1).with_key(&b"a"[..]);
        let second = OperationFrame::request(Opcode::Get, 2).with_key(&b"b"[..]);
        let mut buf = BytesMut::new();
        first.write_to(&mut buf);
        second.write_to(&mut buf);

        let decoded_first = OperationFrame::read_from(&mut buf).unwrap().unwrap();
        let decoded_second = OperationFrame::read_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded_first, first);
        assert_eq!(decoded_second, second);
        assert!(buf.is_empty());
    }
}
