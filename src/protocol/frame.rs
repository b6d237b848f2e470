//! Binary frame protocol with length-prefixed messages
//!
//! Frame format:
//! ```text
//! +---------+---------------+-----------+
//! | type    | length        | payload   |
//! | (1 byte)| (4 bytes, BE) | (variable)|
//! +---------+---------------+-----------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};

/// Frame header size: 1 byte type + 4 bytes length
pub const FRAME_HEADER_SIZE: usize = 5;

/// Default relay message ceiling (100 MiB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Frame types for the relay protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    // Control (0x00 - 0x0F)
    Ping = 0x01,
    Pong = 0x02,
    Goodbye = 0x03,

    // Room membership (0x10 - 0x1F)
    JoinRoom = 0x10,
    LeaveRoom = 0x11,
    RoomUsers = 0x12,
    MembershipChanged = 0x13,

    // Connection negotiation (0x20 - 0x2F)
    Signal = 0x20,

    // Transfer negotiation (0x30 - 0x3F)
    FileOffer = 0x30,
    FileAccept = 0x31,
    FileReject = 0x32,
    FileCancel = 0x33,
    FilePayload = 0x34,
    TransferOffered = 0x38,
    TransferStateChanged = 0x39,
    TransferReady = 0x3A,

    // Data channel (0x40 - 0x4F)
    ChunkedStart = 0x40,
    FileChunk = 0x41,
    FileComplete = 0x42,

    // Error (0xFF)
    Error = 0xFF,
}

impl FrameType {
    /// Convert from u8, returns None for unknown types
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameType::Ping),
            0x02 => Some(FrameType::Pong),
            0x03 => Some(FrameType::Goodbye),

            0x10 => Some(FrameType::JoinRoom),
            0x11 => Some(FrameType::LeaveRoom),
            0x12 => Some(FrameType::RoomUsers),
            0x13 => Some(FrameType::MembershipChanged),

            0x20 => Some(FrameType::Signal),

            0x30 => Some(FrameType::FileOffer),
            0x31 => Some(FrameType::FileAccept),
            0x32 => Some(FrameType::FileReject),
            0x33 => Some(FrameType::FileCancel),
            0x34 => Some(FrameType::FilePayload),
            0x38 => Some(FrameType::TransferOffered),
            0x39 => Some(FrameType::TransferStateChanged),
            0x3A => Some(FrameType::TransferReady),

            0x40 => Some(FrameType::ChunkedStart),
            0x41 => Some(FrameType::FileChunk),
            0x42 => Some(FrameType::FileComplete),

            0xFF => Some(FrameType::Error),
            _ => None,
        }
    }

    /// Check if this frame type belongs on a data channel stream
    pub fn is_data_channel(&self) -> bool {
        let val = *self as u8;
        (0x40..0x50).contains(&val)
    }

    /// Check if only the server may send this frame type
    pub fn is_server_only(&self) -> bool {
        matches!(
            self,
            FrameType::RoomUsers
                | FrameType::MembershipChanged
                | FrameType::TransferOffered
                | FrameType::TransferStateChanged
                | FrameType::TransferReady
                | FrameType::Error
        )
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given type and payload
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame into a buffer.
    ///
    /// Fails if the payload does not fit the 4-byte length header.
    pub fn encode(&self, buf: &mut BytesMut) -> io::Result<()> {
        let len = length_header(self.payload.len())?;
        buf.reserve(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(len);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encode this frame into a new Bytes
    pub fn encode_to_bytes(&self) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Try to decode a frame from a buffer
    /// Returns Ok(Some(frame)) if successful, Ok(None) if more data needed
    pub fn decode(buf: &mut BytesMut, max_payload: usize) -> io::Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming
        let mut cursor = Cursor::new(&buf[..]);
        let frame_type_byte = cursor.get_u8();
        let payload_len = cursor.get_u32() as usize;

        let frame_type = FrameType::from_u8(frame_type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown frame type: 0x{:02X}", frame_type_byte),
            )
        })?;

        if payload_len > max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame payload too large: {} bytes (max: {})",
                    payload_len, max_payload
                ),
            ));
        }

        let total_size = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < total_size {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

fn length_header(payload_len: usize) -> io::Result<u32> {
    u32::try_from(payload_len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Frame payload of {} bytes exceeds the length header", payload_len),
        )
    })
}

/// Streaming frame decoder with a payload ceiling
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with the default ceiling
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec rejecting payloads above `max_payload`
    pub fn with_limit(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_payload,
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame
    pub fn decode_next(&mut self) -> io::Result<Option<Frame>> {
        Frame::decode(&mut self.buffer, self.max_payload)
    }

    /// Get the current buffer length
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_u8() {
        assert_eq!(FrameType::from_u8(0x30), Some(FrameType::FileOffer));
        assert_eq!(FrameType::from_u8(0x41), Some(FrameType::FileChunk));
        assert_eq!(FrameType::from_u8(0xFF), Some(FrameType::Error));
        assert_eq!(FrameType::from_u8(0x00), None);
        assert_eq!(FrameType::from_u8(0x7F), None);
    }

    #[test]
    fn test_frame_codec_streaming() {
        let mut codec = FrameCodec::new();

        let frame1 = Frame::new(FrameType::Ping, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let frame2 = Frame::new(FrameType::FileAccept, vec![11, 12, 13, 14, 15]);

        let mut data = BytesMut::new();
        frame1.encode(&mut data).unwrap();
        frame2.encode(&mut data).unwrap();

        // Not even a full header yet
        codec.feed(&data[..3]);
        assert!(codec.decode_next().unwrap().is_none());

        // Header complete, payload partial
        codec.feed(&data[3..8]);
        assert!(codec.decode_next().unwrap().is_none());

        codec.feed(&data[8..]);
        assert_eq!(codec.decode_next().unwrap(), Some(frame1));
        assert_eq!(codec.decode_next().unwrap(), Some(frame2));
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_frame_type_categories() {
        assert!(FrameType::FileChunk.is_data_channel());
        assert!(!FrameType::FileOffer.is_data_channel());
        assert!(FrameType::FileComplete.is_data_channel());
        assert!(FrameType::TransferReady.is_server_only());
        assert!(!FrameType::FilePayload.is_server_only());
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut data = BytesMut::new();
        data.put_u8(0xFE);
        data.put_u32(0);

        let mut codec = FrameCodec::new();
        codec.feed(&data);
        assert!(codec.decode_next().is_err());
    }

    #[test]
    fn test_frame_over_ceiling() {
        let mut data = BytesMut::new();
        data.put_u8(FrameType::FilePayload as u8);
        data.put_u32(1025);

        let mut codec = FrameCodec::with_limit(1024);
        codec.feed(&data);
        assert!(codec.decode_next().is_err());
    }

    #[test]
    fn test_length_header_bounds() {
        assert_eq!(length_header(0).unwrap(), 0);
        assert_eq!(length_header(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(length_header(u32::MAX as usize + 1).is_err());
    }
}
