//! Serving side: handler table, accept loop and per-connection sessions.
//!
//! ```text
//! accept loop ──spawn──► session (one per connection)
//!                          recv ─► authorize ─► dispatch ─► send
//! ```
//!
//! A session handles one call at a time. Handler errors and panics become
//! Error replies; protocol or transport failures end only that session.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::connection::{Connection, Credentials, Listener};
use super::error::{ErrorKind, RemoteError, RmiError, TransportError};
use super::message::{Message, MessageType};
use super::notification::{Notification, SubscriberId};
use super::param::{FileDescriptor, Pack, PayloadWriter, UnpackArgs};

pub const SUBSCRIBE_METHOD: &str = "Server::subscribe";
pub const UNSUBSCRIBE_METHOD: &str = "Server::unsubscribe";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub type HandlerResult = Result<PayloadWriter, RemoteError>;

type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Decides whether a peer may call a method.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, credentials: &Credentials, method: &str) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&Credentials, &str) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, credentials: &Credentials, method: &str) -> bool {
        self(credentials, method)
    }
}

pub struct Server {
    handlers: HashMap<String, Handler>,
    notifications: Arc<DashMap<String, Arc<Notification>>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let mut server = Self {
            handlers: HashMap::new(),
            notifications: Arc::new(DashMap::new()),
            authorizer: None,
        };
        server.expose_builtins();
        server
    }

    pub fn with_authorizer(mut self, authorizer: impl Authorizer) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Bind `f` to `method`. Arguments and return value are decoded and
    /// encoded with the parameter codec.
    pub fn expose<A, R, E, F, Fut>(&mut self, method: &str, f: F) -> &mut Self
    where
        A: UnpackArgs + Send + 'static,
        R: Pack + Send + 'static,
        E: Into<RemoteError> + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |message: Message| {
            let f = Arc::clone(&f);
            async move {
                let args = message.unpack_args::<A>().map_err(RemoteError::from)?;
                let value = f(args).await.map_err(Into::into)?;
                let mut w = PayloadWriter::new();
                w.push(value).map_err(|e| {
                    RemoteError::new(ErrorKind::Codec, format!("failed to encode reply: {e}"))
                })?;
                Ok(w)
            }
            .boxed()
        });
        if self.handlers.insert(method.to_string(), handler).is_some() {
            tracing::warn!(method, "Replaced existing handler");
        }
        self
    }

    /// Make `notification` reachable through the built-in subscribe method.
    pub fn register_notification(&self, notification: Arc<Notification>) {
        let name = notification.name().to_string();
        tracing::debug!(signal = %name, "Registered notification");
        self.notifications.insert(name, notification);
    }

    pub fn notification(&self, name: &str) -> Option<Arc<Notification>> {
        self.notifications.get(name).map(|n| Arc::clone(n.value()))
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    fn expose_builtins(&mut self) {
        let registry = Arc::clone(&self.notifications);
        self.expose(SUBSCRIBE_METHOD, move |(signal,): (String,)| {
            let registry = Arc::clone(&registry);
            async move {
                let notification = registry
                    .get(&signal)
                    .map(|n| Arc::clone(n.value()))
                    .ok_or_else(|| RemoteError::not_found(format!("unknown signal: {signal}")))?;
                let (id, fd) = notification
                    .create_subscriber()
                    .await
                    .map_err(|e| RemoteError::runtime(e.to_string()))?;
                Ok::<_, RemoteError>((id, FileDescriptor::new(fd)))
            }
        });

        let registry = Arc::clone(&self.notifications);
        self.expose(
            UNSUBSCRIBE_METHOD,
            move |(signal, id): (String, SubscriberId)| {
                let registry = Arc::clone(&registry);
                async move {
                    let notification = registry
                        .get(&signal)
                        .map(|n| Arc::clone(n.value()))
                        .ok_or_else(|| {
                            RemoteError::not_found(format!("unknown signal: {signal}"))
                        })?;
                    Ok::<_, RemoteError>(notification.remove_subscriber(id).await)
                }
            },
        );
    }

    /// Authorize and run one MethodCall. Never panics.
    pub async fn dispatch(&self, credentials: &Credentials, message: Message) -> HandlerResult {
        let method = message.target().to_string();

        if let Some(authorizer) = &self.authorizer
            && !authorizer.authorize(credentials, &method)
        {
            tracing::info!(method, peer = %credentials, "Call denied");
            return Err(RemoteError::new(
                ErrorKind::Permission,
                format!("{method} denied for uid {}", credentials.uid),
            ));
        }

        let Some(handler) = self.handlers.get(&method).cloned() else {
            return Err(RemoteError::not_found(format!("method not found: {method}")));
        };

        match AssertUnwindSafe(handler(message)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(&*panic);
                tracing::error!(method, detail, "Handler panicked");
                Err(RemoteError::runtime(format!("handler panicked: {detail}")))
            }
        }
    }

    /// Serve until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, listener: Listener, mut shutdown: watch::Receiver<bool>) {
        let server = Arc::new(self);
        let mut sessions = JoinSet::new();

        tracing::info!(
            path = ?listener.path(),
            activated = listener.is_activated(),
            methods = server.handlers.len(),
            "Serving"
        );

        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(connection) => {
                        let server = Arc::clone(&server);
                        sessions.spawn(async move { server.serve_connection(connection).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(error = %e, "Session task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(sessions = sessions.len(), "Shutdown requested, closing listener");
                        break;
                    }
                }
            }
        }

        sessions.shutdown().await;
    }

    pub(crate) async fn serve_connection(&self, connection: Connection) {
        let peer = connection.credentials();
        tracing::debug!(%peer, "Session started");

        loop {
            let message = match connection.recv().await {
                Ok(message) => message,
                Err(RmiError::Transport(TransportError::Closed)) => {
                    tracing::debug!(%peer, "Session closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Dropping connection");
                    break;
                }
            };

            if message.kind() != MessageType::MethodCall {
                tracing::warn!(%peer, kind = %message.kind(), "Ignoring non-call message");
                continue;
            }

            let sequence = message.sequence();
            let method = message.target().to_string();
            let reply = match self.dispatch(&peer, message).await {
                Ok(payload) => Ok(Message::reply_from(sequence, &method, payload)),
                Err(err) => {
                    tracing::debug!(method, error = %err, "Call failed");
                    Message::error(sequence, &method, &err)
                }
            };
            let sent = match reply {
                Ok(reply) => connection.send(reply).await,
                Err(e) => Err(e.into()),
            };

            match sent {
                Ok(()) => {}
                Err(RmiError::Protocol(e)) => {
                    tracing::warn!(method, error = %e, "Reply could not be encoded");
                    let err = RemoteError::new(ErrorKind::Codec, e.to_string());
                    let resent = match Message::error(sequence, &method, &err) {
                        Ok(reply) => connection.send(reply).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = resent {
                        tracing::warn!(%peer, error = %e, "Dropping connection");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Dropping connection");
                    break;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
