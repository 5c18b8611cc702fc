//! warden: local-socket RMI and a multi-administrator policy engine.
//!
//! - [`rmi`]: framed method calls, replies, errors and signals over unix
//!   sockets, with descriptor passing and socket activation
//! - [`policy`]: policy values, models, plugin providers, stores and the
//!   manager that reconciles votes
//! - [`service`]: the manager bound to an RMI server, plus a typed client
//! - [`logging`]: the tracing subscriber used by the warden binaries

pub mod logging;
pub mod policy;
pub mod rmi;
pub mod service;

pub use policy::{PolicyError, PolicyManager, PolicyModel, PolicyProvider, PolicyValue};
pub use rmi::{Client, RmiError, Server};
pub use service::{PolicyClient, PolicyService};
