//! Calling side of an RMI connection.
//!
//! One call is in flight per connection: `invoke` holds the call lock from
//! writing the MethodCall until its answer has been read. A call that is
//! cancelled between the two, or whose answer is out of step, leaves the
//! connection unusable and every later call fails with
//! [`TransportError::Closed`].

use std::path::Path;

use tokio::sync::Mutex;

use super::connection::{Connection, Credentials};
use super::error::{ProtocolError, RmiError, TransportError};
use super::message::{Message, MessageType};
use super::notification::{Subscriber, SubscriberId};
use super::param::{FileDescriptor, PackArgs, Unpack};
use super::server::{SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};

#[derive(Debug)]
struct CallState {
    next: u32,
    /// Set while a call is between send and a fully read answer.
    broken: bool,
}

#[derive(Debug)]
pub struct Client {
    connection: Connection,
    /// Doubles as the call lock.
    state: Mutex<CallState>,
}

impl Client {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            state: Mutex::new(CallState {
                next: 1,
                broken: false,
            }),
        }
    }

    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, RmiError> {
        Ok(Self::new(Connection::connect(path).await?))
    }

    pub fn credentials(&self) -> Credentials {
        self.connection.credentials()
    }

    /// Call `method` and decode its single return value.
    pub async fn invoke<R, A>(&self, method: &str, args: A) -> Result<R, RmiError>
    where
        R: Unpack,
        A: PackArgs,
    {
        let mut state = self.state.lock().await;
        if state.broken {
            return Err(TransportError::Closed.into());
        }
        let call = Message::method_call(state.next, method, args)?;
        let sequence = state.next;
        state.next = state.next.wrapping_add(1);

        state.broken = true;
        self.connection.send(call).await?;
        let answer = self.connection.recv().await?;

        if answer.sequence() != sequence {
            tracing::warn!(
                method,
                expected = sequence,
                found = answer.sequence(),
                "Abandoning connection"
            );
            return Err(ProtocolError::SequenceMismatch {
                expected: sequence,
                found: answer.sequence(),
            }
            .into());
        }
        if !matches!(answer.kind(), MessageType::Reply | MessageType::Error) {
            tracing::warn!(method, kind = %answer.kind(), "Abandoning connection");
            return Err(ProtocolError::UnexpectedMessage(answer.kind()).into());
        }
        state.broken = false;
        drop(state);

        match answer.kind() {
            MessageType::Reply => Ok(answer.unpack_reply()?),
            MessageType::Error => {
                let remote = answer.into_remote_error()?;
                tracing::debug!(method, error = %remote, "Remote call failed");
                Err(remote.into())
            }
            other => Err(ProtocolError::UnexpectedMessage(other).into()),
        }
    }

    /// Subscribe to a server-side notification.
    pub async fn subscribe(&self, signal: &str) -> Result<Subscriber, RmiError> {
        let (id, fd): (SubscriberId, FileDescriptor) =
            self.invoke(SUBSCRIBE_METHOD, (signal,)).await?;
        Ok(Subscriber::from_fd(id, signal, fd.into_inner())?)
    }

    /// Returns whether the server still knew the subscription.
    pub async fn unsubscribe(&self, subscriber: &Subscriber) -> Result<bool, RmiError> {
        self.invoke(UNSUBSCRIBE_METHOD, (subscriber.signal(), subscriber.id()))
            .await
    }
}
