//! Remote method invocation over local stream sockets.
//!
//! - [`message`]: frame envelope and its codec
//! - [`param`]: typed parameter block
//! - [`connection`]: listener, duplex connection, peer credentials
//! - [`client`] / [`server`]: calling and serving sides
//! - [`notification`]: signal fan-out to subscribers

pub mod activation;
pub mod client;
pub mod connection;
pub mod error;
mod fdpass;
pub mod message;
pub mod notification;
pub mod param;
pub mod server;

pub use client::Client;
pub use connection::{Connection, Credentials, Listener};
pub use error::{ErrorKind, ProtocolError, RemoteError, RmiError, TransportError};
pub use message::{Message, MessageCodec, MessageType};
pub use notification::{Notification, Subscriber, SubscriberId};
pub use param::{FileDescriptor, Pack, PackArgs, PayloadReader, PayloadWriter, Unpack, UnpackArgs};
pub use server::{Authorizer, Server};
