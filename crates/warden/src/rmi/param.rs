//! Typed parameter block for RMI payloads.
//!
//! A payload is an ordered sequence of entries, each a 1-byte [`ParamTag`], a
//! u32 big-endian length and that many value bytes. Lists nest entries inside
//! the value. Descriptors travel out of band; their entry only holds an index
//! into the message's descriptor list.

use std::fmt;
use std::os::fd::OwnedFd;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::ProtocolError;

/// Tag byte plus u32 length.
pub const ENTRY_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParamTag {
    Unit = 0x00,
    Bool = 0x01,
    Int = 0x02,
    UInt = 0x03,
    Str = 0x04,
    Bytes = 0x05,
    List = 0x06,
    Fd = 0x07,
}

impl ParamTag {
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        Ok(match byte {
            0x00 => Self::Unit,
            0x01 => Self::Bool,
            0x02 => Self::Int,
            0x03 => Self::UInt,
            0x04 => Self::Str,
            0x05 => Self::Bytes,
            0x06 => Self::List,
            0x07 => Self::Fd,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn fixed_len(self) -> Option<usize> {
        match self {
            Self::Unit => Some(0),
            Self::Bool => Some(1),
            Self::Int | Self::UInt => Some(8),
            Self::Fd => Some(4),
            Self::Str | Self::Bytes | Self::List => None,
        }
    }
}

impl fmt::Display for ParamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unit => "unit",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Str => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Fd => "fd",
        };
        f.write_str(name)
    }
}

/// A file descriptor carried alongside a message via `SCM_RIGHTS`.
#[derive(Debug)]
pub struct FileDescriptor(OwnedFd);

impl FileDescriptor {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }

    pub fn into_inner(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for FileDescriptor {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

/// Builds a parameter block.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
    fds: Vec<OwnedFd>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: Pack>(&mut self, value: T) -> Result<(), ProtocolError> {
        value.pack(self)
    }

    /// Write one entry whose value bytes are produced by `value`.
    ///
    /// The length field is back-patched, so `value` may itself write entries.
    pub fn entry(
        &mut self,
        tag: ParamTag,
        value: impl FnOnce(&mut Self) -> Result<(), ProtocolError>,
    ) -> Result<(), ProtocolError> {
        self.buf.put_u8(tag.as_u8());
        let len_at = self.buf.len();
        self.buf.put_u32(0);
        let start = self.buf.len();
        value(self)?;
        let len = self.buf.len() - start;
        let wire_len = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
            len,
            max: u32::MAX as usize,
        })?;
        self.buf[len_at..start].copy_from_slice(&wire_len.to_be_bytes());
        Ok(())
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    fn attach_fd(&mut self, fd: OwnedFd) -> Result<u32, ProtocolError> {
        let index = u32::try_from(self.fds.len()).map_err(|_| {
            ProtocolError::InvalidValue("too many descriptors in one message".to_string())
        })?;
        self.fds.push(fd);
        Ok(index)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_parts(self) -> (Bytes, Vec<OwnedFd>) {
        (self.buf.freeze(), self.fds)
    }
}

/// Reads a parameter block entry by entry.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
    fds: Vec<Option<OwnedFd>>,
}

impl PayloadReader {
    pub fn new(buf: Bytes, fds: Vec<OwnedFd>) -> Self {
        Self {
            buf,
            fds: fds.into_iter().map(Some).collect(),
        }
    }

    pub fn read<T: Unpack>(&mut self) -> Result<T, ProtocolError> {
        T::unpack(self)
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Consume the next entry, which must carry `tag`, and return its value.
    pub fn take(&mut self, tag: ParamTag) -> Result<Bytes, ProtocolError> {
        let (found, value) = self.take_any()?;
        if found != tag {
            return Err(ProtocolError::TagMismatch {
                expected: tag,
                found,
            });
        }
        Ok(value)
    }

    fn take_any(&mut self) -> Result<(ParamTag, Bytes), ProtocolError> {
        let available = self.buf.remaining();
        if available < ENTRY_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: ENTRY_HEADER_LEN,
                available,
            });
        }
        let tag = ParamTag::from_u8(self.buf[0])?;
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        let needed = ENTRY_HEADER_LEN.saturating_add(len);
        if available < needed {
            return Err(ProtocolError::Truncated { needed, available });
        }
        if let Some(fixed) = tag.fixed_len()
            && fixed != len
        {
            return Err(ProtocolError::InvalidLength { tag, len });
        }
        self.buf.advance(ENTRY_HEADER_LEN);
        Ok((tag, self.buf.split_to(len)))
    }

    /// Decode the entries of a nested list with `f`. The list must be fully consumed.
    pub fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut PayloadReader) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let value = self.take(ParamTag::List)?;
        let mut inner = PayloadReader {
            buf: value,
            fds: std::mem::take(&mut self.fds),
        };
        let result = f(&mut inner).and_then(|decoded| {
            inner.finish()?;
            Ok(decoded)
        });
        self.fds = inner.fds;
        result
    }

    /// Fails if any bytes remain unread.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }

    fn take_fd(&mut self, index: u32) -> Result<OwnedFd, ProtocolError> {
        self.fds
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(ProtocolError::MissingDescriptor(index))
    }
}

/// Count descriptor entries in a parameter block, validating its structure.
pub(crate) fn count_descriptors(payload: &Bytes) -> Result<usize, ProtocolError> {
    let mut reader = PayloadReader::new(payload.clone(), Vec::new());
    let mut count = 0usize;
    while !reader.is_empty() {
        let (tag, value) = reader.take_any()?;
        match tag {
            ParamTag::Fd => count += 1,
            ParamTag::List => count += count_descriptors(&value)?,
            _ => {}
        }
    }
    Ok(count)
}

/// A value that can be written as one parameter entry.
pub trait Pack {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError>;
}

/// A value that can be read back from one parameter entry.
pub trait Unpack: Sized {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError>;
}

impl Pack for () {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.entry(ParamTag::Unit, |_| Ok(()))
    }
}

impl Unpack for () {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        r.take(ParamTag::Unit).map(|_| ())
    }
}

impl Pack for bool {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.entry(ParamTag::Bool, |w| {
            w.put(&[u8::from(self)]);
            Ok(())
        })
    }
}

impl Unpack for bool {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        match r.take(ParamTag::Bool)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue(format!(
                "bool byte {other:#04x}"
            ))),
        }
    }
}

fn read_u64(value: &Bytes) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&value[..8]);
    u64::from_be_bytes(raw)
}

macro_rules! signed_param {
    ($($ty:ty),*) => {$(
        impl Pack for $ty {
            fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
                w.entry(ParamTag::Int, |w| {
                    w.put(&i64::from(self).to_be_bytes());
                    Ok(())
                })
            }
        }

        impl Unpack for $ty {
            fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
                let value = read_u64(&r.take(ParamTag::Int)?) as i64;
                <$ty>::try_from(value).map_err(|_| ProtocolError::OutOfRange {
                    value: i128::from(value),
                    target: stringify!($ty),
                })
            }
        }
    )*};
}

macro_rules! unsigned_param {
    ($($ty:ty),*) => {$(
        impl Pack for $ty {
            fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
                w.entry(ParamTag::UInt, |w| {
                    w.put(&u64::from(self).to_be_bytes());
                    Ok(())
                })
            }
        }

        impl Unpack for $ty {
            fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
                let value = read_u64(&r.take(ParamTag::UInt)?);
                <$ty>::try_from(value).map_err(|_| ProtocolError::OutOfRange {
                    value: i128::from(value),
                    target: stringify!($ty),
                })
            }
        }
    )*};
}

signed_param!(i16, i32, i64);
unsigned_param!(u8, u16, u32, u64);

impl Pack for &str {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.entry(ParamTag::Str, |w| {
            w.put(self.as_bytes());
            Ok(())
        })
    }
}

impl Pack for String {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        self.as_str().pack(w)
    }
}

impl Pack for &String {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        self.as_str().pack(w)
    }
}

impl Unpack for String {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        let value = r.take(ParamTag::Str)?;
        String::from_utf8(value.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("string parameter"))
    }
}

impl Pack for Bytes {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.entry(ParamTag::Bytes, |w| {
            w.put(&self);
            Ok(())
        })
    }
}

impl Unpack for Bytes {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        r.take(ParamTag::Bytes)
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.entry(ParamTag::List, |w| {
            for item in self {
                w.push(item)?;
            }
            Ok(())
        })
    }
}

impl<T: Unpack> Unpack for Vec<T> {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        r.nested(|inner| {
            let mut items = Vec::new();
            while !inner.is_empty() {
                items.push(inner.read()?);
            }
            Ok(items)
        })
    }
}

impl<T: Pack> Pack for Option<T> {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.entry(ParamTag::List, |w| match self {
            Some(value) => w.push(value),
            None => Ok(()),
        })
    }
}

impl<T: Unpack> Unpack for Option<T> {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        r.nested(|inner| {
            if inner.is_empty() {
                Ok(None)
            } else {
                inner.read().map(Some)
            }
        })
    }
}

impl<A: Pack, B: Pack> Pack for (A, B) {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        let (a, b) = self;
        w.entry(ParamTag::List, |w| {
            w.push(a)?;
            w.push(b)
        })
    }
}

impl<A: Unpack, B: Unpack> Unpack for (A, B) {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        r.nested(|inner| Ok((inner.read()?, inner.read()?)))
    }
}

impl Pack for FileDescriptor {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        let index = w.attach_fd(self.0)?;
        w.entry(ParamTag::Fd, |w| {
            w.put(&index.to_be_bytes());
            Ok(())
        })
    }
}

impl Unpack for FileDescriptor {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        let value = r.take(ParamTag::Fd)?;
        let index = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
        r.take_fd(index).map(FileDescriptor)
    }
}

/// A call's argument list: every element becomes one top-level entry.
pub trait PackArgs {
    fn pack_args(self, w: &mut PayloadWriter) -> Result<(), ProtocolError>;
}

/// Decodes a call's argument list. The whole block must be consumed.
pub trait UnpackArgs: Sized {
    fn unpack_args(r: &mut PayloadReader) -> Result<Self, ProtocolError>;
}

macro_rules! tuple_args {
    ($($name:ident),*) => {
        impl<$($name: Pack),*> PackArgs for ($($name,)*) {
            #[allow(non_snake_case, unused_variables)]
            fn pack_args(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
                let ($($name,)*) = self;
                $( w.push($name)?; )*
                Ok(())
            }
        }

        impl<$($name: Unpack),*> UnpackArgs for ($($name,)*) {
            #[allow(unused_variables)]
            fn unpack_args(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
                Ok(($(r.read::<$name>()?,)*))
            }
        }
    };
}

tuple_args!();
tuple_args!(A);
tuple_args!(A, B);
tuple_args!(A, B, C);
tuple_args!(A, B, C, D);

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_for(w: PayloadWriter) -> PayloadReader {
        let (payload, fds) = w.into_parts();
        PayloadReader::new(payload, fds)
    }

    #[test]
    fn scalars_round_trip_in_order() {
        let mut w = PayloadWriter::new();
        w.push(true).unwrap();
        w.push(-42i64).unwrap();
        w.push(7u32).unwrap();
        w.push("bluetooth").unwrap();

        let mut r = reader_for(w);
        assert!(r.read::<bool>().unwrap());
        assert_eq!(r.read::<i64>().unwrap(), -42);
        assert_eq!(r.read::<u32>().unwrap(), 7);
        assert_eq!(r.read::<String>().unwrap(), "bluetooth");
        r.finish().unwrap();
    }

    #[test]
    fn nested_lists_round_trip() {
        let rows = vec![
            ("camera".to_string(), 0i64),
            ("bluetooth".to_string(), 10i64),
        ];
        let mut w = PayloadWriter::new();
        w.push(rows.clone()).unwrap();
        w.push(Option::<String>::None).unwrap();
        w.push(Some(3u8)).unwrap();

        let mut r = reader_for(w);
        assert_eq!(r.read::<Vec<(String, i64)>>().unwrap(), rows);
        assert_eq!(r.read::<Option<String>>().unwrap(), None);
        assert_eq!(r.read::<Option<u8>>().unwrap(), Some(3));
        r.finish().unwrap();
    }

    #[test]
    fn mismatched_tag_is_an_error() {
        let mut w = PayloadWriter::new();
        w.push("7").unwrap();

        let mut r = reader_for(w);
        let err = r.read::<i64>().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TagMismatch {
                expected: ParamTag::Int,
                found: ParamTag::Str
            }
        ));
    }

    #[test]
    fn narrowing_out_of_range_fails() {
        let mut w = PayloadWriter::new();
        w.push(i64::MAX).unwrap();

        let mut r = reader_for(w);
        assert!(matches!(
            r.read::<i32>(),
            Err(ProtocolError::OutOfRange { target: "i32", .. })
        ));
    }

    #[test]
    fn truncated_entry_is_detected() {
        let mut w = PayloadWriter::new();
        w.push("policy").unwrap();
        let (payload, _) = w.into_parts();
        let cut = payload.slice(..payload.len() - 2);

        let mut r = PayloadReader::new(cut, Vec::new());
        assert!(matches!(
            r.read::<String>(),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn bad_fixed_length_is_rejected() {
        // bool entry claiming 2 bytes
        let raw = Bytes::from_static(&[0x01, 0, 0, 0, 2, 1, 1]);
        let mut r = PayloadReader::new(raw, Vec::new());
        assert!(matches!(
            r.read::<bool>(),
            Err(ProtocolError::InvalidLength {
                tag: ParamTag::Bool,
                len: 2
            })
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = Bytes::from_static(&[0x7f, 0, 0, 0, 0]);
        let mut r = PayloadReader::new(raw, Vec::new());
        assert!(matches!(
            r.read::<()>(),
            Err(ProtocolError::UnknownTag(0x7f))
        ));
    }

    #[test]
    fn args_tuple_round_trip() {
        let mut w = PayloadWriter::new();
        ("bluetooth", 10i64, "alice").pack_args(&mut w).unwrap();

        let mut r = reader_for(w);
        let (policy, value, admin) = <(String, i64, String)>::unpack_args(&mut r).unwrap();
        assert_eq!(policy, "bluetooth");
        assert_eq!(value, 10);
        assert_eq!(admin, "alice");
    }

    #[test]
    fn descriptor_entries_are_counted() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut w = PayloadWriter::new();
        w.push(FileDescriptor::new(OwnedFd::from(a))).unwrap();
        w.push(("id".to_string(), FileDescriptor::new(OwnedFd::from(b))))
            .unwrap();
        let (payload, fds) = w.into_parts();

        assert_eq!(fds.len(), 2);
        assert_eq!(count_descriptors(&payload).unwrap(), 2);
    }

    #[test]
    fn missing_descriptor_fails_closed() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut w = PayloadWriter::new();
        w.push(FileDescriptor::new(OwnedFd::from(a))).unwrap();
        let (payload, _) = w.into_parts();

        let mut r = PayloadReader::new(payload, Vec::new());
        assert!(matches!(
            r.read::<FileDescriptor>(),
            Err(ProtocolError::MissingDescriptor(0))
        ));
    }
}
