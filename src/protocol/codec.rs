//! Codec for encoding/decoding protocol messages to/from frames
//!
//! This module provides the bridge between typed messages and binary frames.

use super::frame::{Frame, FrameType};
use super::messages::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Error as IoError, ErrorKind};

/// Trait for messages that can be encoded to frames
pub trait Encodable {
    /// Get the frame type for this message
    fn frame_type(&self) -> FrameType;

    /// Encode the message payload to bytes
    fn encode_payload(&self) -> io::Result<Bytes>;

    /// Encode the complete frame
    fn encode_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(self.frame_type(), self.encode_payload()?))
    }
}

/// Trait for messages that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame type for this message
    fn expected_frame_type() -> FrameType;

    /// Decode the message from a payload
    fn decode_payload(payload: &Bytes) -> io::Result<Self>;

    /// Decode from a complete frame, validating the frame type
    fn decode_frame(frame: &Frame) -> io::Result<Self> {
        if frame.frame_type != Self::expected_frame_type() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected frame type {:?}, got {:?}",
                    Self::expected_frame_type(),
                    frame.frame_type
                ),
            ));
        }
        Self::decode_payload(&frame.payload)
    }
}

/// Implement Encodable and Decodable with a JSON payload
macro_rules! impl_codec {
    ($type:ty, $frame_type:expr) => {
        impl Encodable for $type {
            fn frame_type(&self) -> FrameType {
                $frame_type
            }

            fn encode_payload(&self) -> io::Result<Bytes> {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }

        impl Decodable for $type {
            fn expected_frame_type() -> FrameType {
                $frame_type
            }

            fn decode_payload(payload: &Bytes) -> io::Result<Self> {
                serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }
    };
}

// Control
impl_codec!(Ping, FrameType::Ping);
impl_codec!(Pong, FrameType::Pong);
impl_codec!(Goodbye, FrameType::Goodbye);

// Room membership
impl_codec!(JoinRoom, FrameType::JoinRoom);
impl_codec!(LeaveRoom, FrameType::LeaveRoom);
impl_codec!(RoomUsers, FrameType::RoomUsers);
impl_codec!(MembershipChanged, FrameType::MembershipChanged);

// Negotiation
impl_codec!(Signal, FrameType::Signal);

// Transfer
impl_codec!(FileOffer, FrameType::FileOffer);
impl_codec!(FileAccept, FrameType::FileAccept);
impl_codec!(FileReject, FrameType::FileReject);
impl_codec!(FileCancel, FrameType::FileCancel);
impl_codec!(FilePayload, FrameType::FilePayload);
impl_codec!(TransferOffered, FrameType::TransferOffered);
impl_codec!(TransferStateChanged, FrameType::TransferStateChanged);
impl_codec!(TransferReady, FrameType::TransferReady);

// Data channel
impl_codec!(ChunkedStart, FrameType::ChunkedStart);
impl_codec!(FileComplete, FrameType::FileComplete);

impl_codec!(Error, FrameType::Error);

// Chunk layout: session id length (u16 BE), session id (UTF-8), offset (u64 BE), raw bytes.
impl Encodable for FileChunk {
    fn frame_type(&self) -> FrameType {
        FrameType::FileChunk
    }

    fn encode_payload(&self) -> io::Result<Bytes> {
        let id = self.session_id.as_bytes();
        let id_len = u16::try_from(id.len()).map_err(|_| {
            IoError::new(ErrorKind::InvalidInput, "Session id longer than 65535 bytes")
        })?;

        let mut buf = BytesMut::with_capacity(2 + id.len() + 8 + self.payload.len());
        buf.put_u16(id_len);
        buf.put_slice(id);
        buf.put_u64(self.offset);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

impl Decodable for FileChunk {
    fn expected_frame_type() -> FrameType {
        FrameType::FileChunk
    }

    fn decode_payload(payload: &Bytes) -> io::Result<Self> {
        let mut buf = payload.clone();
        if buf.remaining() < 2 {
            return Err(IoError::new(ErrorKind::UnexpectedEof, "Truncated chunk header"));
        }
        let id_len = buf.get_u16() as usize;
        if buf.remaining() < id_len + 8 {
            return Err(IoError::new(ErrorKind::UnexpectedEof, "Truncated chunk header"));
        }

        let id = buf.split_to(id_len);
        let session_id = std::str::from_utf8(&id)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?
            .to_string();
        let offset = buf.get_u64();

        Ok(FileChunk {
            session_id,
            offset,
            payload: buf,
        })
    }
}

/// Any frame decoded into a typed message
#[derive(Debug, Clone)]
pub enum Message {
    // Control
    Ping(Ping),
    Pong(Pong),
    Goodbye(Goodbye),

    // Room membership
    JoinRoom(JoinRoom),
    LeaveRoom(LeaveRoom),
    RoomUsers(RoomUsers),
    MembershipChanged(MembershipChanged),

    // Negotiation
    Signal(Signal),

    // Transfer
    FileOffer(FileOffer),
    FileAccept(FileAccept),
    FileReject(FileReject),
    FileCancel(FileCancel),
    FilePayload(FilePayload),
    TransferOffered(TransferOffered),
    TransferStateChanged(TransferStateChanged),
    TransferReady(TransferReady),

    // Data channel
    ChunkedStart(ChunkedStart),
    FileChunk(FileChunk),
    FileComplete(FileComplete),

    Error(Error),
}

impl Message {
    /// Decode a frame into a typed message
    pub fn decode(frame: &Frame) -> io::Result<Self> {
        let payload = &frame.payload;

        match frame.frame_type {
            FrameType::Ping => Ok(Self::Ping(Ping::decode_payload(payload)?)),
            FrameType::Pong => Ok(Self::Pong(Pong::decode_payload(payload)?)),
            FrameType::Goodbye => Ok(Self::Goodbye(Goodbye::decode_payload(payload)?)),

            FrameType::JoinRoom => Ok(Self::JoinRoom(JoinRoom::decode_payload(payload)?)),
            FrameType::LeaveRoom => Ok(Self::LeaveRoom(LeaveRoom::decode_payload(payload)?)),
            FrameType::RoomUsers => Ok(Self::RoomUsers(RoomUsers::decode_payload(payload)?)),
            FrameType::MembershipChanged => Ok(Self::MembershipChanged(
                MembershipChanged::decode_payload(payload)?,
            )),

            FrameType::Signal => Ok(Self::Signal(Signal::decode_payload(payload)?)),

            FrameType::FileOffer => Ok(Self::FileOffer(FileOffer::decode_payload(payload)?)),
            FrameType::FileAccept => Ok(Self::FileAccept(FileAccept::decode_payload(payload)?)),
            FrameType::FileReject => Ok(Self::FileReject(FileReject::decode_payload(payload)?)),
            FrameType::FileCancel => Ok(Self::FileCancel(FileCancel::decode_payload(payload)?)),
            FrameType::FilePayload => {
                Ok(Self::FilePayload(FilePayload::decode_payload(payload)?))
            }
            FrameType::TransferOffered => Ok(Self::TransferOffered(
                TransferOffered::decode_payload(payload)?,
            )),
            FrameType::TransferStateChanged => Ok(Self::TransferStateChanged(
                TransferStateChanged::decode_payload(payload)?,
            )),
            FrameType::TransferReady => {
                Ok(Self::TransferReady(TransferReady::decode_payload(payload)?))
            }

            FrameType::ChunkedStart => {
                Ok(Self::ChunkedStart(ChunkedStart::decode_payload(payload)?))
            }
            FrameType::FileChunk => Ok(Self::FileChunk(FileChunk::decode_payload(payload)?)),
            FrameType::FileComplete => {
                Ok(Self::FileComplete(FileComplete::decode_payload(payload)?))
            }

            FrameType::Error => Ok(Self::Error(Error::decode_payload(payload)?)),
        }
    }

    /// Encode this message into a frame
    pub fn encode_frame(&self) -> io::Result<Frame> {
        match self {
            Self::Ping(m) => m.encode_frame(),
            Self::Pong(m) => m.encode_frame(),
            Self::Goodbye(m) => m.encode_frame(),
            Self::JoinRoom(m) => m.encode_frame(),
            Self::LeaveRoom(m) => m.encode_frame(),
            Self::RoomUsers(m) => m.encode_frame(),
            Self::MembershipChanged(m) => m.encode_frame(),
            Self::Signal(m) => m.encode_frame(),
            Self::FileOffer(m) => m.encode_frame(),
            Self::FileAccept(m) => m.encode_frame(),
            Self::FileReject(m) => m.encode_frame(),
            Self::FileCancel(m) => m.encode_frame(),
            Self::FilePayload(m) => m.encode_frame(),
            Self::TransferOffered(m) => m.encode_frame(),
            Self::TransferStateChanged(m) => m.encode_frame(),
            Self::TransferReady(m) => m.encode_frame(),
            Self::ChunkedStart(m) => m.encode_frame(),
            Self::FileChunk(m) => m.encode_frame(),
            Self::FileComplete(m) => m.encode_frame(),
            Self::Error(m) => m.encode_frame(),
        }
    }

    /// Encode this message into wire bytes (header and payload)
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        self.encode_frame()?.encode_to_bytes()
    }

    /// Get the frame type of this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Ping(_) => FrameType::Ping,
            Self::Pong(_) => FrameType::Pong,
            Self::Goodbye(_) => FrameType::Goodbye,
            Self::JoinRoom(_) => FrameType::JoinRoom,
            Self::LeaveRoom(_) => FrameType::LeaveRoom,
            Self::RoomUsers(_) => FrameType::RoomUsers,
            Self::MembershipChanged(_) => FrameType::MembershipChanged,
            Self::Signal(_) => FrameType::Signal,
            Self::FileOffer(_) => FrameType::FileOffer,
            Self::FileAccept(_) => FrameType::FileAccept,
            Self::FileReject(_) => FrameType::FileReject,
            Self::FileCancel(_) => FrameType::FileCancel,
            Self::FilePayload(_) => FrameType::FilePayload,
            Self::TransferOffered(_) => FrameType::TransferOffered,
            Self::TransferStateChanged(_) => FrameType::TransferStateChanged,
            Self::TransferReady(_) => FrameType::TransferReady,
            Self::ChunkedStart(_) => FrameType::ChunkedStart,
            Self::FileChunk(_) => FrameType::FileChunk,
            Self::FileComplete(_) => FrameType::FileComplete,
            Self::Error(_) => FrameType::Error,
        }
    }

    /// Check if this message belongs on a data channel stream
    pub fn is_data_channel(&self) -> bool {
        self.frame_type().is_data_channel()
    }
}

/// Encode a message directly to wire bytes (convenience function)
pub fn encode<T: Encodable>(msg: &T) -> io::Result<Bytes> {
    msg.encode_frame()?.encode_to_bytes()
}

/// Decode a frame to a specific message type (convenience function)
pub fn decode<T: Decodable>(frame: &Frame) -> io::Result<T> {
    T::decode_frame(frame)
}
