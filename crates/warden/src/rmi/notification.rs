//! Publish/subscribe over dedicated socket pairs.
//!
//! For each subscriber the publisher keeps one end of a socket pair and hands
//! the other end to the peer through descriptor passing. A signal is encoded
//! once and written to every kept end. The peer reads them with [`Subscriber`].

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;

use super::error::{ProtocolError, RmiError, TransportError};
use super::message::{Message, MessageCodec, MessageType};
use super::param::{Pack, PackArgs, PayloadReader, PayloadWriter, Unpack, UnpackArgs};

/// A subscriber that cannot take a signal within this window is dropped.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(uuid::Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Pack for SubscriberId {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.push(self.0.to_string())
    }
}

impl Unpack for SubscriberId {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        let raw: String = r.read()?;
        Self::parse(&raw)
            .map_err(|e| ProtocolError::InvalidValue(format!("subscriber id {raw:?}: {e}")))
    }
}

/// A named signal and its subscribers.
#[derive(Debug)]
pub struct Notification {
    name: String,
    sequence: AtomicU32,
    subscribers: Mutex<Vec<(SubscriberId, UnixStream)>>,
}

impl Notification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequence: AtomicU32::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a subscriber and return the descriptor to hand to the peer.
    pub async fn create_subscriber(&self) -> Result<(SubscriberId, OwnedFd), TransportError> {
        let (kept, handed) = std::os::unix::net::UnixStream::pair()?;
        kept.set_nonblocking(true)?;
        let kept = UnixStream::from_std(kept)?;

        let id = SubscriberId::new();
        let mut subscribers = self.subscribers.lock().await;
        subscribers.push((id, kept));
        tracing::debug!(
            signal = %self.name,
            subscriber = %id,
            total = subscribers.len(),
            "Subscriber added"
        );
        Ok((id, OwnedFd::from(handed)))
    }

    /// Returns whether `id` was subscribed.
    pub async fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::debug!(signal = %self.name, subscriber = %id, "Subscriber removed");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Fan one Signal out to every subscriber. Returns how many took it.
    ///
    /// Delivery is best effort: a failing subscriber is logged and dropped,
    /// the rest still receive the signal.
    pub async fn notify(&self, args: impl PackArgs) -> Result<usize, ProtocolError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message = Message::signal(sequence, &self.name, args)?;
        if !message.fds().is_empty() {
            return Err(ProtocolError::InvalidValue(
                "signals cannot carry descriptors".to_string(),
            ));
        }
        let frame = message.to_bytes()?;

        let mut subscribers = self.subscribers.lock().await;
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, stream) in subscribers.iter_mut() {
            let outcome = tokio::time::timeout(DELIVERY_TIMEOUT, stream.write_all(&frame)).await;
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(signal = %self.name, subscriber = %id, error = %e, "Signal delivery failed");
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        dropped.push(*id);
                    }
                }
                Err(_) => {
                    // A partial frame may have been written; the stream is unusable.
                    tracing::warn!(signal = %self.name, subscriber = %id, "Signal delivery timed out");
                    dropped.push(*id);
                }
            }
        }
        if !dropped.is_empty() {
            subscribers.retain(|(id, _)| !dropped.contains(id));
        }

        tracing::trace!(signal = %self.name, sequence, delivered, "Signal sent");
        Ok(delivered)
    }
}

/// Client-side end of a subscription.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    signal: String,
    frames: FramedRead<UnixStream, MessageCodec>,
}

impl Subscriber {
    pub fn from_fd(
        id: SubscriberId,
        signal: impl Into<String>,
        fd: OwnedFd,
    ) -> Result<Self, TransportError> {
        let stream = std::os::unix::net::UnixStream::from(fd);
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        Ok(Self {
            id,
            signal: signal.into(),
            frames: FramedRead::new(stream, MessageCodec::new()),
        })
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Arguments of the next signal, or `None` once the publisher hangs up.
    pub async fn recv<A: UnpackArgs>(&mut self) -> Result<Option<A>, RmiError> {
        loop {
            let Some(frame) = self.frames.next().await else {
                return Ok(None);
            };
            let message = frame.map_err(TransportError::Recv)?;
            if message.kind() != MessageType::Signal {
                return Err(ProtocolError::UnexpectedMessage(message.kind()).into());
            }
            if message.target() != self.signal {
                tracing::debug!(expected = %self.signal, got = message.target(), "Skipping foreign signal");
                continue;
            }
            return Ok(Some(message.unpack_args()?));
        }
    }
}
