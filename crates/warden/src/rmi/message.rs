//! Wire envelope for one RMI unit: call, reply, error or signal.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! +------+----------+-------------+------------------+-----------------+
//! | type | sequence | payload len | name len | name  | parameter block |
//! | u8   | u32      | u32         | u32      | utf-8 | entries ...     |
//! +------+----------+-------------+------------------+-----------------+
//! ```
//!
//! `payload len` covers everything after the 9-byte header, so a reader always
//! knows how many more bytes to expect. Descriptors referenced by `fd` entries
//! are not part of the frame.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, RemoteError};
use super::param::{
    Pack, PackArgs, PayloadReader, PayloadWriter, Unpack, UnpackArgs, count_descriptors,
};

pub const HEADER_LEN: usize = 9;

/// Upper bound on `payload len`; larger frames are rejected before their body is read.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    Reply = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MethodCall => "method call",
            Self::Reply => "reply",
            Self::Error => "error",
            Self::Signal => "signal",
        })
    }
}

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub sequence: u32,
    pub payload_len: usize,
}

impl Header {
    pub fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let kind = MessageType::from_u8(raw[0])?;
        let sequence = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let payload_len = u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) as usize;
        if payload_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len: payload_len,
                max: MAX_FRAME_LEN,
            });
        }
        Ok(Self {
            kind,
            sequence,
            payload_len,
        })
    }
}

#[derive(Debug)]
pub struct Message {
    kind: MessageType,
    sequence: u32,
    target: String,
    payload: Bytes,
    fds: Vec<OwnedFd>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.sequence == other.sequence
            && self.target == other.target
            && self.payload == other.payload
            && self.fds.len() == other.fds.len()
    }
}

impl Message {
    fn from_writer(kind: MessageType, sequence: u32, target: &str, w: PayloadWriter) -> Self {
        let (payload, fds) = w.into_parts();
        Self {
            kind,
            sequence,
            target: target.to_string(),
            payload,
            fds,
        }
    }

    pub fn method_call(
        sequence: u32,
        method: &str,
        args: impl PackArgs,
    ) -> Result<Self, ProtocolError> {
        let mut w = PayloadWriter::new();
        args.pack_args(&mut w)?;
        Ok(Self::from_writer(MessageType::MethodCall, sequence, method, w))
    }

    pub fn reply(sequence: u32, method: &str, value: impl Pack) -> Result<Self, ProtocolError> {
        let mut w = PayloadWriter::new();
        w.push(value)?;
        Ok(Self::reply_from(sequence, method, w))
    }

    /// Reply with an already packed return value.
    pub fn reply_from(sequence: u32, method: &str, value: PayloadWriter) -> Self {
        Self::from_writer(MessageType::Reply, sequence, method, value)
    }

    /// Error reply carrying the error's class name and message.
    pub fn error(sequence: u32, method: &str, err: &RemoteError) -> Result<Self, ProtocolError> {
        let mut w = PayloadWriter::new();
        w.push(err.class())?;
        w.push(err.message())?;
        Ok(Self::from_writer(MessageType::Error, sequence, method, w))
    }

    pub fn signal(sequence: u32, name: &str, args: impl PackArgs) -> Result<Self, ProtocolError> {
        let mut w = PayloadWriter::new();
        args.pack_args(&mut w)?;
        Ok(Self::from_writer(MessageType::Signal, sequence, name, w))
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    pub(crate) fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    pub(crate) fn attach_fds(&mut self, fds: Vec<OwnedFd>) {
        self.fds = fds;
    }

    /// Number of descriptors the parameter block references.
    pub fn descriptor_count(&self) -> Result<usize, ProtocolError> {
        count_descriptors(&self.payload)
    }

    pub fn into_reader(self) -> PayloadReader {
        PayloadReader::new(self.payload, self.fds)
    }

    /// Decode the whole parameter block as an argument tuple.
    pub fn unpack_args<A: UnpackArgs>(self) -> Result<A, ProtocolError> {
        let mut r = self.into_reader();
        let args = A::unpack_args(&mut r)?;
        r.finish()?;
        Ok(args)
    }

    /// Decode the single return value of a Reply.
    pub fn unpack_reply<R: Unpack>(self) -> Result<R, ProtocolError> {
        let mut r = self.into_reader();
        let value = r.read::<R>()?;
        r.finish()?;
        Ok(value)
    }

    /// Decode an Error message back into a [`RemoteError`].
    pub fn into_remote_error(self) -> Result<RemoteError, ProtocolError> {
        let (class, message): (String, String) = self.unpack_args()?;
        Ok(RemoteError::from_wire(class, message))
    }

    /// Encode the frame. Descriptors are not written.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let name = self.target.as_bytes();
        let payload_len = 4 + name.len() + self.payload.len();
        if payload_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len: payload_len,
                max: MAX_FRAME_LEN,
            });
        }
        dst.reserve(HEADER_LEN + payload_len);
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.sequence);
        dst.put_u32(payload_len as u32);
        dst.put_u32(name.len() as u32);
        dst.put_slice(name);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Build a message from a parsed header and exactly `header.payload_len` body bytes.
    pub fn from_parts(header: Header, mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() != header.payload_len {
            return Err(ProtocolError::Truncated {
                needed: header.payload_len,
                available: body.len(),
            });
        }
        if body.len() < 4 {
            return Err(ProtocolError::Truncated {
                needed: 4,
                available: body.len(),
            });
        }
        let name_len = body.get_u32() as usize;
        if body.len() < name_len {
            return Err(ProtocolError::Truncated {
                needed: name_len,
                available: body.len(),
            });
        }
        let name = body.split_to(name_len);
        let target = std::str::from_utf8(&name)
            .map_err(|_| ProtocolError::InvalidUtf8("message name"))?
            .to_string();
        Ok(Self {
            kind: header.kind,
            sequence: header.sequence,
            target,
            payload: body,
            fds: Vec::new(),
        })
    }

    /// Decode one complete frame from `src`.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                available: src.len(),
            });
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&src[..HEADER_LEN]);
        let header = Header::parse(&raw)?;
        let body = &src[HEADER_LEN..];
        if body.len() > header.payload_len {
            return Err(ProtocolError::TrailingBytes(body.len() - header.payload_len));
        }
        Self::from_parts(header, Bytes::copy_from_slice(body))
    }
}

/// Frames [`Message`]s on descriptor-free streams.
#[derive(Debug, Default)]
pub struct MessageCodec {
    header: Option<Header>,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    src.reserve(HEADER_LEN - src.len());
                    return Ok(None);
                }
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(&src[..HEADER_LEN]);
                let header = Header::parse(&raw)?;
                src.advance(HEADER_LEN);
                self.header = Some(header);
                header
            }
        };

        if src.len() < header.payload_len {
            src.reserve(header.payload_len - src.len());
            return Ok(None);
        }

        self.header = None;
        let body = src.split_to(header.payload_len).freeze();
        tracing::trace!(kind = %header.kind, sequence = header.sequence, len = header.payload_len, "Decoded frame");
        Message::from_parts(header, body).map(Some)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if !item.fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "descriptors cannot be framed on this stream",
            ));
        }
        item.encode(dst)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
