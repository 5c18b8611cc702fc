//! Local-domain stream sockets: listener and full-duplex connection.
//!
//! A [`Connection`] exclusively owns one socket. Its receive path and send path
//! are each guarded by their own lock, so a reader never blocks a writer and
//! two writers never interleave mid-frame.

use std::fmt;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use super::activation;
use super::error::{ProtocolError, RmiError, TransportError};
use super::fdpass;
use super::message::{HEADER_LEN, Header, Message};

/// Upper bound on descriptors a single frame may reference.
pub const MAX_DESCRIPTORS: usize = 16;

/// The body buffer grows by at most this much per read, so a header alone
/// never reserves the whole advertised payload.
const READ_CHUNK: usize = 64 * 1024;

/// Peer identity captured once when the connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: Option<i32>,
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    fn of(stream: &UnixStream) -> Result<Self, TransportError> {
        let cred = stream.peer_cred().map_err(TransportError::Credentials)?;
        Ok(Self {
            pid: cred.pid(),
            uid: cred.uid(),
            gid: cred.gid(),
        })
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "pid={pid} uid={} gid={}", self.uid, self.gid),
            None => write!(f, "pid=? uid={} gid={}", self.uid, self.gid),
        }
    }
}

fn recv_error(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Recv(e)
    }
}

pub struct Connection {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    credentials: Credentials,
}

impl Connection {
    /// Dial an existing listener.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| TransportError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "Connected");
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: UnixStream) -> Result<Self, TransportError> {
        let credentials = Credentials::of(&stream)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
            credentials,
        })
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Write one whole frame, then any attached descriptors.
    pub async fn send(&self, mut message: Message) -> Result<(), RmiError> {
        let frame = message.to_bytes()?;
        let fds = message.take_fds();

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(TransportError::Send)?;
        for fd in &fds {
            fdpass::send_fd(writer.as_ref(), fd.as_fd())
                .await
                .map_err(|e| TransportError::Descriptor(e.to_string()))?;
        }
        tracing::trace!(
            kind = %message.kind(),
            sequence = message.sequence(),
            target = message.target(),
            len = frame.len(),
            fds = fds.len(),
            "Sent message"
        );
        Ok(())
    }

    /// Read exactly one frame, then the descriptors it references.
    pub async fn recv(&self) -> Result<Message, RmiError> {
        let mut reader = self.reader.lock().await;

        let mut raw = [0u8; HEADER_LEN];
        reader.read_exact(&mut raw).await.map_err(recv_error)?;
        let header = Header::parse(&raw)?;

        let mut body = BytesMut::new();
        while body.len() < header.payload_len {
            let remaining = header.payload_len - body.len();
            body.reserve(remaining.min(READ_CHUNK));
            let read = (&mut *reader)
                .take(remaining as u64)
                .read_buf(&mut body)
                .await
                .map_err(recv_error)?;
            if read == 0 {
                return Err(TransportError::Closed.into());
            }
        }
        let mut message = Message::from_parts(header, body.freeze())?;

        let expected = message.descriptor_count()?;
        if expected > MAX_DESCRIPTORS {
            return Err(ProtocolError::InvalidValue(format!(
                "{expected} descriptors exceed limit of {MAX_DESCRIPTORS}"
            ))
            .into());
        }
        if expected > 0 {
            let mut fds = Vec::with_capacity(expected);
            for _ in 0..expected {
                let fd = fdpass::recv_fd(reader.as_ref())
                    .await
                    .map_err(|e| TransportError::Descriptor(e.to_string()))?;
                fds.push(fd);
            }
            message.attach_fds(fds);
        }

        tracing::trace!(
            kind = %message.kind(),
            sequence = message.sequence(),
            target = message.target(),
            fds = expected,
            "Received message"
        );
        Ok(message)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

/// Listening socket, either bound here or adopted from the service supervisor.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    /// Set when this process created the socket file and must remove it.
    path: Option<PathBuf>,
}

impl Listener {
    /// Remove any stale socket at `path`, then bind and listen.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = path.as_ref();
        let bind_error = |source| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(bind_error)?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_error(e)),
        }

        let std_listener = StdUnixListener::bind(path).map_err(bind_error)?;
        std_listener.set_nonblocking(true)?;
        let inner = UnixListener::from_std(std_listener)?;

        tracing::debug!(path = %path.display(), "Bound socket");
        Ok(Self {
            inner,
            path: Some(path.to_path_buf()),
        })
    }

    /// Adopt the supervisor-provided socket, if any.
    pub fn from_activation() -> Result<Option<Self>, TransportError> {
        let Some(std_listener) = activation::take_listener()? else {
            return Ok(None);
        };
        std_listener.set_nonblocking(true)?;
        let inner = UnixListener::from_std(std_listener)?;
        Ok(Some(Self { inner, path: None }))
    }

    /// Prefer an activation socket, fall back to binding `path`.
    pub fn bind_or_activate(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        match Self::from_activation()? {
            Some(listener) => Ok(listener),
            None => Self::create(path),
        }
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, _) = self.inner.accept().await.map_err(TransportError::Accept)?;
        Connection::from_stream(stream)
    }

    /// Socket path, when this process created it.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_activated(&self) -> bool {
        self.path.is_none()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.path
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmi::message::MessageType;
    use crate::rmi::param::FileDescriptor;
    use std::os::fd::OwnedFd;

    #[tokio::test]
    async fn create_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::create(&path).unwrap();
        assert_eq!(listener.path(), Some(path.as_path()));
        assert!(!listener.is_activated());

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn credentials_describe_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.sock");
        let listener = Listener::create(&path).unwrap();

        let (client, server) = tokio::join!(Connection::connect(&path), listener.accept());
        let client = client.unwrap();
        let server = server.unwrap();

        let expected_pid = i32::try_from(std::process::id()).unwrap();
        assert_eq!(server.credentials().pid, Some(expected_pid));
        assert_eq!(client.credentials().uid, server.credentials().uid);
    }

    #[tokio::test]
    async fn messages_and_descriptors_cross_the_connection() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Connection::from_stream(a).unwrap();
        let b = Connection::from_stream(b).unwrap();

        let (x, _y) = std::os::unix::net::UnixStream::pair().unwrap();
        let call = Message::method_call(
            5,
            "Server::subscribe",
            ("changed", FileDescriptor::new(OwnedFd::from(x))),
        )
        .unwrap();
        a.send(call).await.unwrap();
        a.send(Message::method_call(6, "PolicyManager::getAll", ()).unwrap())
            .await
            .unwrap();

        let first = b.recv().await.unwrap();
        assert_eq!(first.kind(), MessageType::MethodCall);
        assert_eq!(first.sequence(), 5);
        assert_eq!(first.fds().len(), 1);
        let (signal, _fd): (String, FileDescriptor) = first.unpack_args().unwrap();
        assert_eq!(signal, "changed");

        let second = b.recv().await.unwrap();
        assert_eq!(second.sequence(), 6);
        assert_eq!(second.target(), "PolicyManager::getAll");
    }

    #[tokio::test]
    async fn peer_hangup_is_reported_as_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        let b = Connection::from_stream(b).unwrap();
        drop(a);

        assert!(matches!(
            b.recv().await,
            Err(RmiError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn body_spanning_many_reads() {
        let (a, b) = UnixStream::pair().unwrap();
        let a = Connection::from_stream(a).unwrap();
        let b = Connection::from_stream(b).unwrap();

        let blob = bytes::Bytes::from(vec![0x5a; 3 * READ_CHUNK + 17]);
        let sent = Message::method_call(4, "Test::blob", (blob.clone(),)).unwrap();
        let writer = tokio::spawn(async move { a.send(sent).await.unwrap() });

        let received = b.recv().await.unwrap();
        writer.await.unwrap();
        let (got,): (bytes::Bytes,) = received.unpack_args().unwrap();
        assert_eq!(got, blob);
    }

    #[tokio::test]
    async fn truncated_body_is_closed() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let b = Connection::from_stream(b).unwrap();

        // Header advertises 8 MiB, only three bytes follow.
        let mut frame = vec![1u8, 0, 0, 0, 1];
        frame.extend_from_slice(&(8u32 << 20).to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0]);
        a.write_all(&frame).await.unwrap();
        drop(a);

        assert!(matches!(
            b.recv().await,
            Err(RmiError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn garbage_header_is_a_protocol_error() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let b = Connection::from_stream(b).unwrap();
        a.write_all(&[0xee; HEADER_LEN]).await.unwrap();

        assert!(matches!(
            b.recv().await,
            Err(RmiError::Protocol(ProtocolError::UnknownMessageType(0xee)))
        ));
    }
}
