//! Error taxonomy for the RMI layer.
//!
//! - **TransportError**: socket create/connect/send/recv failures. Fatal to the
//!   call, never to the daemon.
//! - **ProtocolError**: malformed frames, tags or lengths. The connection that
//!   produced it is abandoned.
//! - **RemoteError**: a handler error marshaled by class name and rebuilt on the
//!   calling side.

use std::io;
use std::path::PathBuf;

use super::message::MessageType;
use super::param::ParamTag;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },

    #[error("failed to connect to {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("failed to read peer credentials: {0}")]
    Credentials(#[source] io::Error),

    #[error("descriptor passing failed: {0}")]
    Descriptor(String),

    #[error("socket activation: {0}")]
    Activation(String),

    #[error("socket setup failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unknown parameter tag {0:#04x}")]
    UnknownTag(u8),

    #[error("expected {expected} parameter, found {found}")]
    TagMismatch { expected: ParamTag, found: ParamTag },

    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} trailing bytes after last parameter")]
    TrailingBytes(usize),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("{tag} parameter has invalid length {len}")]
    InvalidLength { tag: ParamTag, len: usize },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("integer {value} out of range for {target}")]
    OutOfRange { value: i128, target: &'static str },

    #[error("descriptor index {0} not attached to message")]
    MissingDescriptor(u32),

    #[error("invalid parameter value: {0}")]
    InvalidValue(String),

    #[error("reply sequence {found} does not match call {expected}")]
    SequenceMismatch { expected: u32, found: u32 },

    #[error("unexpected {0} message")]
    UnexpectedMessage(MessageType),
}

/// Local error kinds a remote class name maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Permission,
    Policy,
    Codec,
    Storage,
    Runtime,
    /// Class name not in the table. Never treated as success.
    Unknown,
}

const CLASS_TABLE: &[(&str, ErrorKind)] = &[
    ("NotFoundException", ErrorKind::NotFound),
    ("InvalidArgumentException", ErrorKind::InvalidArgument),
    ("PermissionException", ErrorKind::Permission),
    ("PolicyException", ErrorKind::Policy),
    ("CodecException", ErrorKind::Codec),
    ("StorageException", ErrorKind::Storage),
    ("RuntimeException", ErrorKind::Runtime),
];

impl ErrorKind {
    pub fn class_name(self) -> &'static str {
        CLASS_TABLE
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(class, _)| *class)
            .unwrap_or("UnknownException")
    }

    pub fn from_class_name(class: &str) -> Self {
        CLASS_TABLE
            .iter()
            .find(|(name, _)| *name == class)
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

/// Handler failure as carried by an Error message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct RemoteError {
    kind: ErrorKind,
    class: String,
    message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            class: kind.class_name().to_string(),
            message: message.into(),
        }
    }

    /// Rebuild from the wire. Unrecognised classes keep their name but map to
    /// [`ErrorKind::Unknown`].
    pub fn from_wire(class: impl Into<String>, message: impl Into<String>) -> Self {
        let class = class.into();
        Self {
            kind: ErrorKind::from_class_name(&class),
            class,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ProtocolError> for RemoteError {
    fn from(err: ProtocolError) -> Self {
        Self::invalid_argument(err.to_string())
    }
}

/// Everything an RMI call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum RmiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl RmiError {
    /// The remote error kind, if the peer answered with an Error message.
    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(err) => Some(err.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_class_names_round_trip() {
        for (class, kind) in CLASS_TABLE {
            assert_eq!(ErrorKind::from_class_name(class), *kind);
            assert_eq!(kind.class_name(), *class);
        }
    }

    #[test]
    fn unknown_class_falls_back_to_unknown_kind() {
        let err = RemoteError::from_wire("std::bad_alloc", "out of memory");
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.class(), "std::bad_alloc");
        assert_eq!(err.message(), "out of memory");
    }

    #[test]
    fn remote_error_display() {
        let err = RemoteError::not_found("method not found: Foo::bar");
        assert_eq!(
            err.to_string(),
            "NotFoundException: method not found: Foo::bar"
        );
    }

    #[test]
    fn rmi_error_exposes_remote_kind() {
        let err = RmiError::from(RemoteError::new(ErrorKind::Policy, "denied"));
        assert_eq!(err.remote_kind(), Some(ErrorKind::Policy));
        assert_eq!(RmiError::from(TransportError::Closed).remote_kind(), None);
    }
}
